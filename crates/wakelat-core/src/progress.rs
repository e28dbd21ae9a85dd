//! One-line measurement progress display.

use std::io::{IsTerminal, Write};
use std::time::Instant;

use crate::human;

/// Interval between progress updates, in seconds.
const PERIOD_SECS: f64 = 1.0;

/// Prints a periodically refreshed `datapoints: N, max. latency: X us`
/// line. On a terminal the line is refreshed in place with `\r`; otherwise
/// plain lines are printed at the same rate to keep logs readable.
#[derive(Debug)]
pub struct ProgressLine {
    enabled: bool,
    is_tty: bool,
    started: Instant,
    last_update: Option<Instant>,
    printed: bool,
}

impl ProgressLine {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            is_tty: std::io::stdout().is_terminal(),
            started: Instant::now(),
            last_update: None,
            printed: false,
        }
    }

    /// Begin tracking. Resets the start timestamp.
    pub fn start(&mut self) {
        self.started = Instant::now();
        self.last_update = None;
    }

    /// Seconds since [`ProgressLine::start`].
    pub fn duration_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Update the progress line with the current datapoint count and
    /// maximum observed latency (microseconds). Rate-limited to one update
    /// per period unless `last` is set.
    pub fn update(&mut self, datapoints: u64, max_latency_us: f64, last: bool) {
        if !self.enabled {
            return;
        }
        if !last {
            if let Some(at) = self.last_update {
                if at.elapsed().as_secs_f64() < PERIOD_SECS {
                    return;
                }
            }
        }
        self.last_update = Some(Instant::now());
        self.printed = true;

        let elapsed = human::duration_secs(self.duration_secs());
        let line =
            format!("datapoints: {datapoints}, max. latency: {max_latency_us:.2} us, {elapsed}");
        if self.is_tty {
            print!("\r{line}");
            if last {
                println!();
            }
            let _ = std::io::stdout().flush();
        } else {
            println!("{line}");
        }
    }

    /// Final update; prints the closing newline on terminals.
    pub fn finish(&mut self, datapoints: u64, max_latency_us: f64) {
        if self.printed || self.enabled {
            self.update(datapoints, max_latency_us, true);
        }
    }
}
