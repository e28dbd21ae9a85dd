//! Error types for the measurement pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a measurement run.
///
/// Per-datapoint problems (negative time after adjustment, timing-gate
/// failures, overhead exceeding latency) are not errors: the offending
/// datapoint is dropped and logged at debug level inside the component.
#[derive(Error, Debug)]
pub enum Error {
    /// Failure reading or writing the kernel producer.
    #[error("producer: {msg}")]
    Producer {
        /// What failed.
        msg: String,
    },

    /// TSC rate estimation produced a non-positive rate.
    #[error("TSC rate estimation failed: computed {mhz} MHz, expected a positive rate")]
    TscEstimation {
        /// The computed rate in MHz.
        mhz: f64,
    },

    /// Every idle state is disabled on the measured CPU.
    #[error("no idle states are enabled on CPU {cpu}")]
    NoEnabledCStates {
        /// Measured CPU index.
        cpu: u32,
    },

    /// A raw datapoint carried a C-state index the OS does not report.
    #[error(
        "bad C-state index '{index}' in the following datapoint:\n{datapoint}Allowed indexes are: {known}"
    )]
    BadCStateIndex {
        /// The offending index.
        index: i64,
        /// `index (name)` list of known indexes.
        known: String,
        /// Compact dump of the offending datapoint.
        datapoint: String,
    },

    /// A time metric came out negative, which signals a producer bug.
    #[error("negative '{metric}' value. The datapoint is:\n{datapoint}")]
    NegativeTime {
        /// The negative metric.
        metric: String,
        /// Compact dump of the offending datapoint.
        datapoint: String,
    },

    /// `TotCyc` was zero, which signals a producer bug.
    #[error("zero total cycles ('TotCyc'). The datapoint is:\n{datapoint}")]
    ZeroTotCyc {
        /// Compact dump of the offending datapoint.
        datapoint: String,
    },

    /// A producer-side invariant was violated.
    #[error("{msg}")]
    Invariant {
        /// Which invariant, and the offending datapoint.
        msg: String,
    },

    /// The producer emits datapoints but none pass the pipeline.
    #[error(
        "no datapoints accepted for {timeout_secs} seconds. While the producer does emit them, \
         they are all being rejected. One possible reason is that they do not pass the filters"
    )]
    NoProgress {
        /// The watchdog interval that expired.
        timeout_secs: f64,
    },

    /// A user-supplied filter expression failed to parse or evaluate.
    #[error("filter expression '{expr}': {reason}")]
    FilterExpr {
        /// The expression as the user wrote it.
        expr: String,
        /// Parse or evaluation failure, including the metrics present.
        reason: String,
    },

    /// The output directory already contains result files.
    #[error("cannot use '{path}' as the output directory, it already contains '{existing}'")]
    ResultDirExists {
        /// The output directory.
        path: PathBuf,
        /// The file that is in the way.
        existing: String,
    },

    /// A result directory could not be loaded.
    #[error("cannot load result at '{path}': {reason}")]
    BadResult {
        /// The result directory.
        path: PathBuf,
        /// Why it does not load.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Sidecar serialization error.
    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a producer failure with a formatted message.
    pub fn producer(msg: impl Into<String>) -> Self {
        Self::Producer { msg: msg.into() }
    }
}
