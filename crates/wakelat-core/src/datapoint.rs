//! Raw and processed datapoint representation.
//!
//! A datapoint is an ordered mapping from metric name to scalar value. The
//! kernel producer emits raw datapoints as `key=value` records; the pipeline
//! extends them with derived metrics (`WakeLatency`, `IntrLatency`, C-state
//! residencies) and finally projects them down to the CSV column set. Field
//! order matters: the CSV header is the field order of the first processed
//! datapoint, so the map preserves insertion order.

use std::collections::HashMap;
use std::fmt;

// Required raw metric names, as emitted by the kernel producer.
pub const REQ_CSTATE: &str = "ReqCState";
pub const TOT_CYC: &str = "TotCyc";
pub const CC0_CYC: &str = "CC0Cyc";
pub const BI_CYC: &str = "BICyc";
pub const BI_MONOTONIC: &str = "BIMonotonic";
pub const LTIME: &str = "LTime";
pub const TBI: &str = "TBI";
pub const TAI: &str = "TAI";
pub const TINTR: &str = "TIntr";
pub const AITS1: &str = "AITS1";
pub const AITS2: &str = "AITS2";
pub const INTR_TS1: &str = "IntrTS1";
pub const INTR_TS2: &str = "IntrTS2";
pub const SMI_CNT: &str = "SMICnt";
pub const NMI_CNT: &str = "NMICnt";
pub const LDIST: &str = "LDist";

// Optional driver-provided calibration offsets (nanoseconds).
pub const TBI_ADJ: &str = "TBIAdj";
pub const TAI_ADJ: &str = "TAIAdj";
pub const TINTR_ADJ: &str = "TIntrAdj";

// Metrics synthesized by the datapoint processor.
pub const SILENT_TIME: &str = "SilentTime";
pub const SILENT_TIME_RAW: &str = "SilentTimeRaw";
pub const WAKE_LATENCY: &str = "WakeLatency";
pub const WAKE_LATENCY_RAW: &str = "WakeLatencyRaw";
pub const INTR_LATENCY: &str = "IntrLatency";
pub const INTR_LATENCY_RAW: &str = "IntrLatencyRaw";
pub const INTR_OFF: &str = "IntrOff";
pub const CC1_DERIVED: &str = "CC1Derived%";

/// A single metric value.
///
/// Raw datapoints carry only integers and floats. The pipeline adds names
/// (`ReqCState` becomes a C-state name string once resolved) and booleans
/// (`IntrOff`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Name(String),
}

impl Value {
    /// The value as an integer, truncating floats. `None` for names/bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// The value as a float. `None` for names/bools.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Name(v) => write!(f, "{v}"),
        }
    }
}

/// An insertion-ordered metric → value mapping.
#[derive(Debug, Clone, Default)]
pub struct Datapoint {
    names: Vec<String>,
    values: HashMap<String, Value>,
}

impl Datapoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metric value, appending the name on first insertion.
    pub fn set(&mut self, name: &str, value: Value) {
        if self.values.insert(name.to_string(), value).is_none() {
            self.names.push(name.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let value = self.values.remove(name)?;
        self.names.retain(|n| n != name);
        Some(value)
    }

    /// Keep only the metrics `keep` returns `true` for, preserving order.
    pub fn retain<F: Fn(&str) -> bool>(&mut self, keep: F) {
        let values = &mut self.values;
        self.names.retain(|name| {
            if keep(name.as_str()) {
                true
            } else {
                values.remove(name);
                false
            }
        });
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Metric names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().map(|n| (n.as_str(), &self.values[n]))
    }

    /// Integer value of a metric, truncating floats.
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_float)
    }

    /// Compact multi-line `metric: value` dump for log and error messages.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}

impl FromIterator<(String, Value)> for Datapoint {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut dp = Self::new();
        for (name, value) in iter {
            dp.set(&name, value);
        }
        dp
    }
}

/// Whether `metric` is a C-state cycle counter (`CC6Cyc`, `PC2Cyc`, ...).
pub fn is_cscyc_metric(metric: &str) -> bool {
    (metric.starts_with("CC") || metric.starts_with("PC"))
        && metric.ends_with("Cyc")
        && metric.len() > 5
}

/// Whether `metric` is a C-state residency percentage (`CC6%`, `PC2%`, ...).
pub fn is_csres_metric(metric: &str) -> bool {
    (metric.starts_with("CC") || metric.starts_with("PC"))
        && metric.ends_with('%')
        && metric.len() > 3
}

/// The C-state name a metric refers to, or `None` for non-C-state metrics.
///
/// `CC6Cyc` and `CC6%` both map to `CC6`; the software-derived
/// `CC1Derived%` maps to `CC1`.
pub fn csname_of(metric: &str) -> Option<&str> {
    if !metric.starts_with("CC") && !metric.starts_with("PC") {
        return None;
    }

    let csname = if let Some(stripped) = metric.strip_suffix("Cyc") {
        stripped.strip_suffix("Derived").unwrap_or(stripped)
    } else if let Some(stripped) = metric.strip_suffix('%') {
        stripped.strip_suffix("Derived").unwrap_or(stripped)
    } else {
        return None;
    };

    if csname.len() > 2 { Some(csname) } else { None }
}

/// The cycle-counter metric name for a C-state.
pub fn cscyc_metric(csname: &str) -> String {
    format!("{csname}Cyc")
}

/// The residency metric name for a C-state.
pub fn csres_metric(csname: &str) -> String {
    format!("{csname}%")
}
