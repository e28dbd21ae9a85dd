//! The measurement run loop.
//!
//! Pulls raw datapoints from the provider, pipes them through the datapoint
//! processor, and writes the accepted rows to the result. The first raw
//! datapoint defines the metric list and is the first one processed; the
//! loop then continues until the requested datapoint count is collected,
//! the time limit expires, the user cancels, or the producer goes silent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::datapoint::{self as dp, Datapoint};
use crate::error::{Error, Result};
use crate::human;
use crate::process::DatapointProcessor;
use crate::progress::ProgressLine;
use crate::provider::RawSource;
use crate::result::RunResult;

/// Default per-datapoint timeout: at least one datapoint should be accepted
/// within this interval once the producer is running.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The watchdog fires after this multiple of the per-datapoint timeout.
const WATCHDOG_FACTOR: f64 = 1.5;

/// Outcome of a completed (or cancelled) measurement run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Accepted datapoints written to the CSV file.
    pub collected: u64,
    /// Maximum observed latency in microseconds, using the more trustworthy
    /// of `WakeLatency` / `IntrLatency` per datapoint.
    pub max_latency_us: f64,
    pub duration_secs: f64,
    /// The run was cut short by user cancellation.
    pub interrupted: bool,
}

/// Runs wake latency measurement experiments.
pub struct Runner {
    source: Box<dyn RawSource>,
    processor: DatapointProcessor,
    /// Taken on close; `None` only after the run finished or failed.
    result: Option<RunResult>,
    progress: ProgressLine,
    timeout: Duration,
    cancel: Arc<AtomicBool>,

    collected: u64,
    max_latency_us: f64,
}

impl Runner {
    pub fn new(
        source: Box<dyn RawSource>,
        processor: DatapointProcessor,
        result: RunResult,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            processor,
            result: Some(result),
            progress: ProgressLine::new(true),
            timeout: DEFAULT_TIMEOUT,
            cancel,
            collected: 0,
            max_latency_us: 0.0,
        }
    }

    /// Override the per-datapoint watchdog timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Disable the interactive progress line.
    pub fn quiet(&mut self) {
        self.progress = ProgressLine::new(false);
    }

    /// Prepare the producer and record the device information in the
    /// sidecar. Must be called before [`Runner::run`]. A preparation
    /// failure closes the result, removing the files it created.
    pub fn prepare(&mut self) -> Result<()> {
        if let Err(err) = self.source.prepare() {
            if let Some(result) = self.result.take() {
                let _ = result.close();
            }
            return Err(err);
        }

        let device = self.source.device();
        if let Some(result) = &mut self.result {
            result.info.devid = device.devid.clone();
            result.info.devdescr = device.descr.clone();
            result.info.resolution = device.resolution_ns;
        }
        Ok(())
    }

    /// Run the measurements: collect up to `dpcnt` datapoints, optionally
    /// bounded by the `tlimit` wall-clock limit.
    ///
    /// On every exit path the producer is stopped and the sidecar written;
    /// a run that collected nothing removes the result files it created.
    pub fn run(mut self, dpcnt: u64, tlimit: Option<Duration>) -> Result<RunSummary> {
        let mut result = self.result.take().ok_or_else(|| Error::Invariant {
            msg: "the runner was not prepared".to_string(),
        })?;
        result.write_info()?;

        let mut msg = format!(
            "Start measuring CPU {}, collecting {dpcnt} datapoints",
            result.info.cpu
        );
        if let Some(limit) = tlimit {
            msg += &format!(", time limit is {}", human::duration_secs(limit.as_secs_f64()));
        }
        log::info!("{msg}");

        self.progress.start();
        self.source.start()?;

        let outcome = self.collect(&mut result, dpcnt, tlimit);
        self.progress.finish(self.collected, self.max_latency_us);

        let stop_outcome = self.source.stop();
        let duration_secs = self.progress.duration_secs();
        result.info.duration = Some(human::duration_secs(duration_secs));

        let cpu = result.info.cpu;
        match outcome {
            Ok(interrupted) => {
                stop_outcome?;
                result.write_info()?;
                result.close()?;
                log::info!(
                    "Finished measuring CPU {cpu}, lasted {}",
                    human::duration_secs(duration_secs)
                );
                Ok(RunSummary {
                    collected: self.collected,
                    max_latency_us: self.max_latency_us,
                    duration_secs,
                    interrupted,
                })
            }
            Err(err) => {
                // Best-effort cleanup: the measurement error is what the
                // caller needs to see.
                let _ = result.write_info();
                let _ = result.close();
                Err(err)
            }
        }
    }

    /// The collection loop. Returns whether the run was cancelled.
    fn collect(
        &mut self,
        result: &mut RunResult,
        dpcnt: u64,
        tlimit: Option<Duration>,
    ) -> Result<bool> {
        let Some(first) = self.source.next_datapoint()? else {
            return Ok(false);
        };
        self.processor.prepare(&first);

        let watchdog = Duration::from_secs_f64(self.timeout.as_secs_f64() * WATCHDOG_FACTOR);
        let start_time = Instant::now();
        let mut last_accepted = Instant::now();

        // The first datapoint both defines the metric list and gets
        // processed like any other.
        let mut next = Some(first);

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                log::info!("interrupted, stopping the measurements");
                return Ok(true);
            }

            let Some(rawdp) = next.take() else {
                return Ok(false);
            };

            if last_accepted.elapsed() > watchdog {
                return Err(Error::NoProgress {
                    timeout_secs: watchdog.as_secs_f64(),
                });
            }

            self.processor.add_raw(rawdp)?;

            for processed in self.processor.drain()? {
                if !result.has_header() {
                    let header = processed.names().map(str::to_string).collect();
                    result.set_header(header)?;
                }
                if !result.add_row(&processed)? {
                    // The datapoint did not pass the row filters.
                    continue;
                }

                self.collected += 1;
                last_accepted = Instant::now();
                self.track_latency(&processed);
                self.progress.update(self.collected, self.max_latency_us, false);

                if self.collected >= dpcnt {
                    return Ok(false);
                }
            }

            if let Some(limit) = tlimit {
                if start_time.elapsed() > limit {
                    log::info!(
                        "time limit of {} reached",
                        human::duration_secs(limit.as_secs_f64())
                    );
                    return Ok(false);
                }
            }

            next = self.source.next_datapoint()?;
        }
    }

    /// Wake and interrupt latency are measured one after the other, in an
    /// order that depends on the C-state interrupt order. Whichever was
    /// measured first is the more accurate one, and it is also the smaller
    /// one, so the smaller value feeds the maximum-latency readout.
    fn track_latency(&mut self, processed: &Datapoint) {
        let wake = processed.float(dp::WAKE_LATENCY).unwrap_or(f64::INFINITY);
        let latency = match processed.float(dp::INTR_LATENCY) {
            Some(intr) => wake.min(intr),
            None => wake,
        };
        if latency.is_finite() && latency > self.max_latency_us {
            self.max_latency_us = latency;
        }
    }
}
