//! # wakelat-core
//!
//! Core library of `wakelat`, a tool measuring how long a CPU core takes to
//! wake from an idle state. A kernel-resident producer arms a delayed wake
//! event, lets the CPU enter the requested C-state, and captures paired
//! timestamps and performance counters around the idle entry/exit. This
//! crate ingests that raw stream and turns it into a result directory.
//!
//! ## Pipeline
//!
//! Provider → TSC estimator → C-state classifier → datapoint processor →
//! row filter → CSV.
//!
//! - [`provider::RawSource`] decodes the producer's `key=value` records and
//!   drives the debugfs control knobs.
//! - [`tsc::TscEstimator`] derives the TSC frequency from the data itself
//!   for backends that report time in cycles.
//! - [`cstates::CStateClassifier`] learns, per requestable C-state, whether
//!   it is entered with interrupts disabled - by majority vote where the
//!   answer is genuinely ambiguous.
//! - [`process::DatapointProcessor`] validates each datapoint, compensates
//!   driver overhead, and derives latency and residency metrics.
//! - [`result::RunResult`] applies the user's row filters and writes the
//!   `datapoints.csv` + `info.yml` result directory.
//! - [`runner::Runner`] orchestrates the above with a progress line, a
//!   producer watchdog, and cooperative cancellation.

pub mod cpuidle;
pub mod cstates;
pub mod datapoint;
pub mod defs;
pub mod error;
pub mod filter;
pub mod human;
pub mod process;
pub mod progress;
pub mod provider;
pub mod reportid;
pub mod result;
pub mod runner;
pub mod tsc;

pub use cpuidle::CStateDirectory;
pub use datapoint::{Datapoint, Value};
pub use error::{Error, Result};
pub use filter::RowFilter;
pub use process::{DatapointProcessor, ProcessorConfig};
pub use provider::{DebugfsSource, DeviceInfo, RawSource, SourceConfig};
pub use result::{LoadedResult, RunResult, SidecarInfo, load_result};
pub use runner::{RunSummary, Runner};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
