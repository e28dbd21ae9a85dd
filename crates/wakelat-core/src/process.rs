//! Raw datapoint processing.
//!
//! The [`DatapointProcessor`] takes raw datapoints on input and provides
//! processed datapoints on output: it derives the latency metrics,
//! compensates for driver-induced overhead, computes C-state residency
//! percentages, converts nanoseconds to microseconds, and projects the
//! datapoint down to the CSV column set.
//!
//! Two helpers may hold datapoints back: the TSC estimator buffers until
//! the rate is known, and the C-state classifier buffers until interrupt
//! order is settled. [`DatapointProcessor::drain`] releases everything that
//! became processable since the last call.

use std::collections::HashSet;

use crate::cpuidle::CStateDirectory;
use crate::cstates::CStateClassifier;
use crate::datapoint::{self as dp, Datapoint, Value, cscyc_metric, csname_of, csres_metric, is_cscyc_metric};
use crate::defs::{Defs, Unit};
use crate::error::{Error, Result};
use crate::tsc::TscEstimator;

/// Residency percentages above this are clamped: the hardware counters are
/// not precise, especially over short sleeps.
const RESIDENCY_CLAMP_PCT: f64 = 100.0;

/// Residency percentages above this get a warning rather than a debug
/// message before clamping.
const RESIDENCY_WARN_PCT: f64 = 300.0;

/// Configuration for a [`DatapointProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Whether the backend reports time in TSC cycles ("TSC-native").
    pub tsc_native: bool,
    /// Interrupts are enabled before the C-state is requested.
    pub early_intr: bool,
    /// Keep all raw datapoint fields in the processed output.
    pub keep_raw: bool,
    /// Time to spend collecting datapoints for TSC rate estimation, ns.
    pub tsc_cal_time_ns: i64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tsc_native: false,
            early_intr: false,
            keep_raw: false,
            tsc_cal_time_ns: crate::tsc::DEFAULT_CAL_TIME_NS,
        }
    }
}

/// Turns raw datapoints into processed datapoints.
#[derive(Debug)]
pub struct DatapointProcessor {
    config: ProcessorConfig,
    tsc: TscEstimator,
    cstates: CStateClassifier,

    /// Projection set: metrics that survive into processed datapoints.
    fields: HashSet<String>,
    /// Metrics converted from nanoseconds to microseconds at the end.
    us_fields: HashSet<String>,
    /// Residency metrics to emit, one per C-state cycle counter present.
    cs_fields: Vec<String>,
    has_cstates: bool,
    prepared: bool,

    /// Processed datapoints waiting to be drained.
    ready: Vec<Datapoint>,

    warned_intr_on_tsc: bool,
    warned_early_intr: bool,
}

impl DatapointProcessor {
    pub fn new(directory: CStateDirectory, config: ProcessorConfig) -> Self {
        let tsc = TscEstimator::new(config.tsc_native, config.tsc_cal_time_ns);
        let cstates = CStateClassifier::new(directory, config.early_intr);
        Self {
            config,
            tsc,
            cstates,
            fields: HashSet::new(),
            us_fields: HashSet::new(),
            cs_fields: Vec::new(),
            has_cstates: false,
            prepared: false,
            ready: Vec::new(),
            warned_intr_on_tsc: false,
            warned_early_intr: false,
        }
    }

    /// Prepare for processing using the first raw datapoint.
    ///
    /// The first datapoint defines the raw metric list: the definitions are
    /// expanded against it, the microsecond conversion set is captured, and
    /// one residency metric is scheduled per C-state cycle counter present.
    pub fn prepare(&mut self, first: &Datapoint) {
        let raw_fields: Vec<String> = first.names().map(str::to_string).collect();
        let defs = Defs::new(raw_fields.iter().map(String::as_str));

        self.cs_fields.clear();
        self.has_cstates = false;
        for metric in &raw_fields {
            if !is_cscyc_metric(metric) {
                continue;
            }
            if let Some(csname) = csname_of(metric) {
                self.has_cstates = true;
                self.cs_fields.push(csres_metric(csname));
            }
        }

        self.us_fields = defs
            .metrics()
            .filter(|m| defs.unit(m) == Some(Unit::Microsecond))
            .map(str::to_string)
            .collect();

        self.fields = defs.metrics().map(str::to_string).collect();
        if self.config.keep_raw {
            self.fields.extend(raw_fields);
        }

        self.prepared = true;
    }

    /// Add a raw datapoint. Output, if any, accumulates for
    /// [`DatapointProcessor::drain`].
    pub fn add_raw(&mut self, datapoint: Datapoint) -> Result<()> {
        debug_assert!(self.prepared, "add_raw() before prepare()");

        let Some(datapoint) = self.tsc.feed(datapoint)? else {
            return Ok(());
        };
        let Some(datapoint) = self.cstates.feed(datapoint)? else {
            return Ok(());
        };
        if let Some(processed) = self.transform(datapoint)? {
            self.ready.push(processed);
        }
        Ok(())
    }

    /// Take every processed datapoint that became available: datapoints
    /// released by the TSC estimator and the classifier, then the ones
    /// processed directly by [`DatapointProcessor::add_raw`].
    pub fn drain(&mut self) -> Result<Vec<Datapoint>> {
        let mut out = Vec::new();

        for datapoint in self.tsc.drain() {
            let Some(datapoint) = self.cstates.feed(datapoint)? else {
                continue;
            };
            if let Some(processed) = self.transform(datapoint)? {
                out.push(processed);
            }
        }

        for datapoint in self.cstates.drain() {
            if let Some(processed) = self.transform(datapoint)? {
                out.push(processed);
            }
        }

        out.append(&mut self.ready);
        Ok(out)
    }

    /// Process one classified datapoint. `None` means the datapoint was
    /// dropped (soft failure, logged at debug level).
    fn transform(&mut self, mut datapoint: Datapoint) -> Result<Option<Datapoint>> {
        if !self.process_time(&mut datapoint)? {
            return Ok(None);
        }
        self.process_cstates(&mut datapoint)?;

        // Save time in microseconds.
        let names: Vec<String> = datapoint.names().map(str::to_string).collect();
        for name in names {
            if self.us_fields.contains(&name) {
                if let Some(val) = datapoint.float(&name) {
                    datapoint.set(&name, Value::Float(val / 1000.0));
                }
            }
        }

        datapoint.retain(|name| self.fields.contains(name));
        Ok(Some(datapoint))
    }

    fn required(&self, datapoint: &Datapoint, metric: &str) -> Result<i64> {
        datapoint.int(metric).ok_or_else(|| Error::Invariant {
            msg: format!(
                "datapoint without the required '{metric}' field:\n{}",
                datapoint.dump()
            ),
        })
    }

    /// Calculate and validate the latency metrics. Returns `false` when the
    /// datapoint has to be dropped.
    fn process_time(&mut self, datapoint: &mut Datapoint) -> Result<bool> {
        let ltime = self.required(datapoint, dp::LTIME)?;
        let tbi = self.required(datapoint, dp::TBI)?;
        let tai = self.required(datapoint, dp::TAI)?;
        let tintr = self.required(datapoint, dp::TINTR)?;

        let mut silent = ltime - tbi;
        let mut wake = tai - ltime;
        let mut intr = tintr - ltime;

        datapoint.set(dp::SILENT_TIME, Value::Int(silent));
        datapoint.set(dp::WAKE_LATENCY, Value::Int(wake));
        datapoint.set(dp::INTR_LATENCY, Value::Int(intr));

        for metric in [dp::LDIST, dp::SILENT_TIME, dp::INTR_LATENCY, dp::WAKE_LATENCY] {
            if datapoint.int(metric).unwrap_or(0) < 0 {
                return Err(Error::NegativeTime {
                    metric: metric.to_string(),
                    datapoint: datapoint.dump(),
                });
            }
        }

        if self.config.tsc_native {
            // The backend reports time in TSC cycles, convert to ns. The
            // estimator released this datapoint, so the rate is known.
            silent = self.cyc_to_ns(silent, datapoint)?;
            wake = self.cyc_to_ns(wake, datapoint)?;
            intr = self.cyc_to_ns(intr, datapoint)?;
        }

        datapoint.set(dp::SILENT_TIME, Value::Int(silent));
        datapoint.set(dp::WAKE_LATENCY, Value::Int(wake));
        datapoint.set(dp::INTR_LATENCY, Value::Int(intr));
        datapoint.set(dp::WAKE_LATENCY_RAW, Value::Int(wake));
        datapoint.set(dp::INTR_LATENCY_RAW, Value::Int(intr));

        if !self.apply_adjustments(datapoint, silent, &mut wake, &mut intr) {
            return Ok(false);
        }

        if !self.compensate_overhead(datapoint, &mut wake, &mut intr)? {
            return Ok(false);
        }

        datapoint.set(dp::WAKE_LATENCY, Value::Int(wake));
        datapoint.set(dp::INTR_LATENCY, Value::Int(intr));

        if self.config.tsc_native {
            // A TSC-deadline backend measures 'WakeLatency' for the next
            // armed deadline, which is not necessarily ours, so its
            // 'IntrLatency' is unreliable. Remove it.
            datapoint.remove(dp::INTR_LATENCY);
            datapoint.remove(dp::INTR_LATENCY_RAW);
        }

        Ok(true)
    }

    fn cyc_to_ns(&self, cyc: i64, datapoint: &Datapoint) -> Result<i64> {
        self.tsc.cyc_to_ns(cyc).ok_or_else(|| Error::Invariant {
            msg: format!(
                "processing a TSC-cycles datapoint before the TSC rate is known:\n{}",
                datapoint.dump()
            ),
        })
    }

    /// Apply driver-provided calibration offsets and validate the results.
    /// Returns `false` when the datapoint has to be dropped.
    fn apply_adjustments(
        &self,
        datapoint: &mut Datapoint,
        silent: i64,
        wake: &mut i64,
        intr: &mut i64,
    ) -> bool {
        if let Some(tbi_adj) = datapoint.int(dp::TBI_ADJ) {
            datapoint.set(dp::SILENT_TIME_RAW, Value::Int(silent));
            datapoint.set(dp::SILENT_TIME, Value::Int(silent - tbi_adj));

            let tbi = datapoint.int(dp::TBI).unwrap_or(0);
            let ltime = datapoint.int(dp::LTIME).unwrap_or(0);
            if tbi + tbi_adj >= ltime {
                log::debug!(
                    "adjusted 'TBI' is greater than 'LTime', the armed event must have fired \
                     before the CPU entered idle. Dropping the following datapoint\n{}",
                    datapoint.dump()
                );
                return false;
            }
        }

        if let Some(tai_adj) = datapoint.int(dp::TAI_ADJ) {
            *wake -= tai_adj;
            let tai = datapoint.int(dp::TAI).unwrap_or(0);
            let ltime = datapoint.int(dp::LTIME).unwrap_or(0);
            if tai - tai_adj <= ltime {
                log::debug!(
                    "adjusted 'TAI' is smaller than 'LTime', the CPU must have woken up before \
                     'LTime'. Dropping the following datapoint\n{}",
                    datapoint.dump()
                );
                return false;
            }
        }

        if let Some(tintr_adj) = datapoint.int(dp::TINTR_ADJ) {
            *intr -= tintr_adj;
            let tintr = datapoint.int(dp::TINTR).unwrap_or(0);
            let ltime = datapoint.int(dp::LTIME).unwrap_or(0);
            if tintr - tintr_adj <= ltime {
                log::debug!(
                    "adjusted 'TIntr' is smaller than 'LTime', the CPU must have woken up before \
                     'LTime'. Dropping the following datapoint\n{}",
                    datapoint.dump()
                );
                return false;
            }
        }

        true
    }

    /// Compensate for the overhead the measurement driver itself introduces.
    /// Returns `false` when the datapoint has to be dropped.
    fn compensate_overhead(
        &mut self,
        datapoint: &Datapoint,
        wake: &mut i64,
        intr: &mut i64,
    ) -> Result<bool> {
        let intr_off = datapoint
            .get(dp::INTR_OFF)
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::Invariant {
                msg: format!(
                    "datapoint reached the processor without an '{}' flag:\n{}",
                    dp::INTR_OFF,
                    datapoint.dump()
                ),
            })?;

        if intr_off {
            // The CPU ran the after-idle code before the interrupt handler;
            // the after-idle bracket is the overhead delaying the handler.
            if self.config.early_intr {
                if !self.warned_early_intr {
                    self.warned_early_intr = true;
                    log::warn!(
                        "hit a datapoint with interrupts disabled even though the early \
                         interrupts feature is enabled"
                    );
                }
                log::debug!(
                    "interrupts disabled with early interrupts enabled. Dropping the following \
                     datapoint\n{}",
                    datapoint.dump()
                );
                return Ok(false);
            }

            let overhead = self.required(datapoint, dp::AITS2)?
                - self.required(datapoint, dp::AITS1)?;

            if overhead >= *intr {
                // Most probably the overhead was measured with monotonic
                // time while 'IntrLatency' came from the event device: two
                // different time sources.
                log::debug!(
                    "the overhead ({overhead}) is greater than 'IntrLatency'. Dropping the \
                     following datapoint\n{}",
                    datapoint.dump()
                );
                return Ok(false);
            }
            if *wake >= *intr - overhead {
                log::debug!(
                    "'WakeLatency' is greater than 'IntrLatency' - overhead ({overhead}), even \
                     though interrupts were disabled. Dropping the following datapoint\n{}",
                    datapoint.dump()
                );
                return Ok(false);
            }
            *intr -= overhead;
        } else {
            if self.config.tsc_native {
                // Interrupt-enabled C-states cannot be measured with a
                // TSC-deadline backend: the handler may fire for a deadline
                // other than ours.
                if !self.warned_intr_on_tsc {
                    self.warned_intr_on_tsc = true;
                    let csname = datapoint
                        .get(dp::REQ_CSTATE)
                        .and_then(Value::as_name)
                        .unwrap_or("?");
                    log::warn!(
                        "the {csname} C-state has interrupts enabled and cannot be measured \
                         with a TSC-deadline backend, use another device for it"
                    );
                }
                log::debug!(
                    "dropping interrupt-enabled datapoint on a TSC-deadline backend:\n{}",
                    datapoint.dump()
                );
                return Ok(false);
            }

            // The interrupt handler ran before the after-idle code; the
            // handler bracket is the overhead delaying 'WakeLatency'.
            let overhead = self.required(datapoint, dp::INTR_TS2)?
                - self.required(datapoint, dp::INTR_TS1)?;

            if overhead >= *wake {
                log::debug!(
                    "the overhead ({overhead}) is greater than 'WakeLatency'. Dropping the \
                     following datapoint\n{}",
                    datapoint.dump()
                );
                return Ok(false);
            }
            if *intr >= *wake - overhead {
                log::debug!(
                    "'IntrLatency' is greater than 'WakeLatency' - overhead ({overhead}), even \
                     though interrupts were enabled. Dropping the following datapoint\n{}",
                    datapoint.dump()
                );
                return Ok(false);
            }
            *wake -= overhead;
        }

        Ok(true)
    }

    /// Validate the cycle counters and populate the residency metrics.
    fn process_cstates(&self, datapoint: &mut Datapoint) -> Result<()> {
        let tot_cyc = self.required(datapoint, dp::TOT_CYC)?;
        let cc0_cyc = self.required(datapoint, dp::CC0_CYC)?;

        if tot_cyc == 0 {
            return Err(Error::ZeroTotCyc {
                datapoint: datapoint.dump(),
            });
        }
        // The driver reads the TSC around the MPERF reads, so total cycles
        // must cover the C0 cycles.
        if tot_cyc < cc0_cyc {
            return Err(Error::Invariant {
                msg: format!(
                    "total cycles ('TotCyc') is smaller than CC0 cycles. The datapoint is:\n{}",
                    datapoint.dump()
                ),
            });
        }

        let poll = datapoint.get(dp::REQ_CSTATE).and_then(Value::as_name) == Some("POLL");

        for res_field in &self.cs_fields {
            let csname = csname_of(res_field).unwrap_or_default();
            let cyc_field = cscyc_metric(csname);

            // In the POLL case only CC0% is meaningful.
            if poll && cyc_field != dp::CC0_CYC {
                datapoint.set(res_field, Value::Float(0.0));
                continue;
            }

            let cyc = self.required(datapoint, &cyc_field)?;
            let mut pct = cyc as f64 / tot_cyc as f64 * 100.0;
            if pct > RESIDENCY_CLAMP_PCT {
                let msg = format!(
                    "too high {csname} residency of {pct:.1}%, using {RESIDENCY_CLAMP_PCT}% \
                     instead. The datapoint is:\n{}",
                    datapoint.dump()
                );
                if pct > RESIDENCY_WARN_PCT {
                    log::warn!("{msg}");
                } else {
                    log::debug!("{msg}");
                }
                pct = RESIDENCY_CLAMP_PCT;
            }
            datapoint.set(res_field, Value::Float(pct));
        }

        // Populate 'CC1Derived%' - the software-calculated CC1 residency:
        // total cycles minus cycles in core C-states other than CC1. Useful
        // because not every platform has a hardware CC1 counter.
        let derived = if self.has_cstates && !poll {
            let mut non_cc1_cyc = 0i64;
            for (name, value) in datapoint.iter() {
                if is_cscyc_metric(name)
                    && name.starts_with("CC")
                    && csname_of(name) != Some("CC1")
                {
                    non_cc1_cyc += value.as_int().unwrap_or(0);
                }
            }
            ((tot_cyc - non_cc1_cyc) as f64 / tot_cyc as f64 * 100.0).max(0.0)
        } else {
            0.0
        };
        datapoint.set(dp::CC1_DERIVED, Value::Float(derived));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuidle::CStateInfo;

    fn directory() -> CStateDirectory {
        let states = vec![
            CStateInfo { index: 0, name: "POLL".into(), disabled: false },
            CStateInfo { index: 1, name: "C1".into(), disabled: false },
            CStateInfo { index: 2, name: "C6".into(), disabled: false },
        ];
        CStateDirectory::from_states(0, states).unwrap()
    }

    fn processor(config: ProcessorConfig) -> DatapointProcessor {
        DatapointProcessor::new(directory(), config)
    }

    /// A raw POLL datapoint with interrupt-handler-first timing.
    fn poll_dp() -> Datapoint {
        let mut raw = Datapoint::new();
        raw.set(dp::REQ_CSTATE, Value::Int(0));
        raw.set(dp::LDIST, Value::Int(500));
        raw.set(dp::LTIME, Value::Int(1_000));
        raw.set(dp::TBI, Value::Int(500));
        raw.set(dp::TAI, Value::Int(1_200));
        raw.set(dp::TINTR, Value::Int(1_150));
        raw.set(dp::AITS1, Value::Int(1_210));
        raw.set(dp::AITS2, Value::Int(1_220));
        raw.set(dp::INTR_TS1, Value::Int(1_140));
        raw.set(dp::INTR_TS2, Value::Int(1_160));
        raw.set(dp::TOT_CYC, Value::Int(10_000));
        raw.set(dp::CC0_CYC, Value::Int(10_000));
        raw.set("CC6Cyc", Value::Int(0));
        raw.set(dp::BI_CYC, Value::Int(0));
        raw.set(dp::BI_MONOTONIC, Value::Int(0));
        raw.set(dp::SMI_CNT, Value::Int(0));
        raw.set(dp::NMI_CNT, Value::Int(0));
        raw
    }

    /// A raw C6 datapoint with after-idle-first timing (interrupts
    /// disabled), the values of the overhead compensation scenario.
    fn c6_dp() -> Datapoint {
        let mut raw = Datapoint::new();
        raw.set(dp::REQ_CSTATE, Value::Int(2));
        raw.set(dp::LDIST, Value::Int(1_000));
        raw.set(dp::LTIME, Value::Int(10_000));
        raw.set(dp::TBI, Value::Int(9_000));
        raw.set(dp::TAI, Value::Int(20_000));
        raw.set(dp::TINTR, Value::Int(25_000));
        raw.set(dp::AITS1, Value::Int(20_050));
        raw.set(dp::AITS2, Value::Int(20_250));
        raw.set(dp::INTR_TS1, Value::Int(24_990));
        raw.set(dp::INTR_TS2, Value::Int(25_010));
        raw.set(dp::TOT_CYC, Value::Int(1_000_000));
        raw.set(dp::CC0_CYC, Value::Int(10_000));
        raw.set("CC6Cyc", Value::Int(900_000));
        raw.set(dp::BI_CYC, Value::Int(0));
        raw.set(dp::BI_MONOTONIC, Value::Int(0));
        raw.set(dp::SMI_CNT, Value::Int(0));
        raw.set(dp::NMI_CNT, Value::Int(0));
        raw
    }

    fn run_one(proc_: &mut DatapointProcessor, raw: Datapoint) -> Result<Vec<Datapoint>> {
        proc_.add_raw(raw)?;
        proc_.drain()
    }

    #[test]
    fn test_poll_residency() {
        let mut proc_ = processor(ProcessorConfig::default());
        proc_.prepare(&poll_dp());

        let out = run_one(&mut proc_, poll_dp()).unwrap();
        assert_eq!(out.len(), 1);
        let got = &out[0];

        assert_eq!(got.get(dp::REQ_CSTATE), Some(&Value::Name("POLL".into())));
        assert_eq!(got.get(dp::INTR_OFF), Some(&Value::Bool(false)));
        // SilentTime 500ns, WakeLatency (200 - 20 overhead)ns, IntrLatency
        // 150ns, all in microseconds.
        assert_eq!(got.float(dp::SILENT_TIME), Some(0.5));
        assert_eq!(got.float(dp::WAKE_LATENCY), Some(0.18));
        assert_eq!(got.float(dp::INTR_LATENCY), Some(0.15));
        // POLL: only CC0% is computed, the rest is zero.
        assert_eq!(got.float("CC0%"), Some(100.0));
        assert_eq!(got.float("CC6%"), Some(0.0));
        assert_eq!(got.float(dp::CC1_DERIVED), Some(0.0));
        // Raw counters do not survive the projection.
        assert!(!got.contains(dp::TOT_CYC));
        assert!(!got.contains(dp::TBI));
    }

    #[test]
    fn test_c6_overhead_compensation() {
        let mut proc_ = processor(ProcessorConfig::default());
        proc_.prepare(&c6_dp());

        let out = run_one(&mut proc_, c6_dp()).unwrap();
        assert_eq!(out.len(), 1);
        let got = &out[0];

        assert_eq!(got.get(dp::INTR_OFF), Some(&Value::Bool(true)));
        assert_eq!(got.float(dp::SILENT_TIME), Some(1.0));
        assert_eq!(got.float(dp::WAKE_LATENCY), Some(10.0));
        // IntrLatency 15000ns minus the 200ns after-idle bracket.
        assert_eq!(got.float(dp::INTR_LATENCY), Some(14.8));
        assert_eq!(got.float(dp::INTR_LATENCY_RAW), Some(15.0));
        assert_eq!(got.float("CC6%"), Some(90.0));
        assert_eq!(got.float("CC0%"), Some(1.0));
        assert_eq!(got.float(dp::CC1_DERIVED), Some(9.0));
    }

    #[test]
    fn test_c6_overhead_exceeding_latency_drops() {
        let mut proc_ = processor(ProcessorConfig::default());
        proc_.prepare(&c6_dp());

        // After-idle bracket of 9950ns: WakeLatency 10000 >= 15000 - 9950.
        let mut raw = c6_dp();
        raw.set(dp::AITS2, Value::Int(30_000));
        // Move 'IntrTS1' up so the classifier's timing gate still passes.
        raw.set(dp::INTR_TS1, Value::Int(30_000));
        let out = run_one(&mut proc_, raw).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_residency_clamp() {
        let mut proc_ = processor(ProcessorConfig::default());
        proc_.prepare(&c6_dp());

        let mut raw = c6_dp();
        raw.set("CC6Cyc", Value::Int(1_500_000));
        let out = run_one(&mut proc_, raw).unwrap();
        assert_eq!(out[0].float("CC6%"), Some(100.0));
        // Derived CC1 would go negative and is clamped to zero.
        assert_eq!(out[0].float(dp::CC1_DERIVED), Some(0.0));
    }

    #[test]
    fn test_zero_totcyc_is_fatal() {
        let mut proc_ = processor(ProcessorConfig::default());
        proc_.prepare(&c6_dp());

        let mut raw = c6_dp();
        raw.set(dp::TOT_CYC, Value::Int(0));
        let err = run_one(&mut proc_, raw).unwrap_err();
        assert!(matches!(err, Error::ZeroTotCyc { .. }));
    }

    #[test]
    fn test_totcyc_below_cc0_is_fatal() {
        let mut proc_ = processor(ProcessorConfig::default());
        proc_.prepare(&c6_dp());

        let mut raw = c6_dp();
        raw.set(dp::TOT_CYC, Value::Int(5_000));
        let err = run_one(&mut proc_, raw).unwrap_err();
        assert!(matches!(err, Error::Invariant { .. }));
    }

    #[test]
    fn test_negative_time_is_fatal() {
        let mut proc_ = processor(ProcessorConfig::default());
        proc_.prepare(&c6_dp());

        // TBI after LTime: negative SilentTime.
        let mut raw = c6_dp();
        raw.set(dp::TBI, Value::Int(11_000));
        let err = run_one(&mut proc_, raw).unwrap_err();
        match err {
            Error::NegativeTime { metric, .. } => assert_eq!(metric, dp::SILENT_TIME),
            other => panic!("expected NegativeTime, got {other:?}"),
        }
    }

    #[test]
    fn test_adjustments() {
        let mut proc_ = processor(ProcessorConfig::default());
        let mut first = c6_dp();
        first.set(dp::TBI_ADJ, Value::Int(100));
        first.set(dp::TAI_ADJ, Value::Int(200));
        first.set(dp::TINTR_ADJ, Value::Int(300));
        proc_.prepare(&first);

        let out = run_one(&mut proc_, first.clone()).unwrap();
        assert_eq!(out.len(), 1);
        let got = &out[0];
        // SilentTime 1000 - 100, WakeLatency 10000 - 200 - 200 (overhead),
        // IntrLatency 15000 - 300 - 200 (overhead).
        assert_eq!(got.float(dp::SILENT_TIME), Some(0.9));
        assert_eq!(got.float(dp::SILENT_TIME_RAW), Some(1.0));
        assert_eq!(got.float(dp::WAKE_LATENCY), Some(9.8));
        assert_eq!(got.float(dp::INTR_LATENCY), Some(14.5));

        // An adjustment pushing 'TAI' behind 'LTime' drops the datapoint.
        let mut raw = first.clone();
        raw.set(dp::TAI_ADJ, Value::Int(10_001));
        let out = run_one(&mut proc_, raw).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_keep_raw_retains_counters() {
        let mut proc_ = processor(ProcessorConfig {
            keep_raw: true,
            ..ProcessorConfig::default()
        });
        proc_.prepare(&c6_dp());

        let out = run_one(&mut proc_, c6_dp()).unwrap();
        assert!(out[0].contains(dp::TOT_CYC));
        assert!(out[0].contains(dp::TBI));
    }

    #[test]
    fn test_tsc_native_drops_interrupt_latency() {
        let mut proc_ = processor(ProcessorConfig {
            tsc_native: true,
            tsc_cal_time_ns: 1_000,
            ..ProcessorConfig::default()
        });
        proc_.prepare(&c6_dp());

        // Resolve the TSC rate first: 1000 cycles per microsecond (1 GHz)
        // keeps cycle values numerically equal to nanoseconds.
        let mut a = c6_dp();
        a.set(dp::BI_CYC, Value::Int(0));
        a.set(dp::BI_MONOTONIC, Value::Int(0));
        proc_.add_raw(a).unwrap();
        let mut b = c6_dp();
        b.set(dp::BI_CYC, Value::Int(2_000));
        b.set(dp::BI_MONOTONIC, Value::Int(2_000));
        proc_.add_raw(b).unwrap();

        let out = proc_.drain().unwrap();
        assert_eq!(out.len(), 2);
        for got in &out {
            assert_eq!(got.float(dp::WAKE_LATENCY), Some(10.0));
            assert!(!got.contains(dp::INTR_LATENCY));
            assert!(!got.contains(dp::INTR_LATENCY_RAW));
        }
    }

    #[test]
    fn test_tsc_native_drops_interrupt_enabled_cstates() {
        let mut proc_ = processor(ProcessorConfig {
            tsc_native: true,
            tsc_cal_time_ns: 1_000,
            ..ProcessorConfig::default()
        });
        proc_.prepare(&poll_dp());

        let mut a = poll_dp();
        a.set(dp::BI_MONOTONIC, Value::Int(0));
        proc_.add_raw(a).unwrap();
        let mut b = poll_dp();
        b.set(dp::BI_CYC, Value::Int(2_000));
        b.set(dp::BI_MONOTONIC, Value::Int(2_000));
        proc_.add_raw(b).unwrap();

        // Both datapoints are POLL (interrupts enabled) on a TSC-deadline
        // backend: all dropped.
        assert!(proc_.drain().unwrap().is_empty());
    }
}
