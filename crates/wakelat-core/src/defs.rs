//! Metric definitions (AKA "defs").
//!
//! The definitions dictionary describes every metric that may appear in the
//! `datapoints.csv` file: its unit, a human-readable title, and a
//! description. The datapoint processor uses the key set to project
//! processed datapoints down to the CSV column set, and the unit to decide
//! which metrics get the final nanosecond → microsecond conversion.
//!
//! Core C-state names are platform-dependent, so the base table uses the
//! `CCx` / `PCx` placeholders. [`Defs::new`] expands the placeholders
//! against the C-state cycle counters observed in the first raw datapoint:
//! a raw header with `CC0Cyc`, `CC6Cyc` and `PC2Cyc` produces the `CC0%`,
//! `CC6%` and `PC2%` definitions.

use std::collections::HashMap;

use crate::datapoint::{csname_of, is_cscyc_metric};

/// The semantic unit of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Nanosecond,
    Microsecond,
    Percent,
    Count,
}

/// The scalar kind a metric carries in processed datapoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Int,
    Float,
    Bool,
    Name,
}

/// Definition of a single metric.
#[derive(Debug, Clone)]
pub struct MetricDef {
    pub metric: String,
    pub kind: Kind,
    pub unit: Option<Unit>,
    pub short_unit: &'static str,
    pub title: String,
    pub descr: String,
}

struct Template {
    metric: &'static str,
    kind: Kind,
    unit: Option<Unit>,
    short_unit: &'static str,
    title: &'static str,
    descr: &'static str,
}

// Definition order is CSV column order. The `CCx` / `PCx` entries are
// placeholders expanded per platform.
static TEMPLATES: &[Template] = &[
    Template {
        metric: "ReqCState",
        kind: Kind::Name,
        unit: None,
        short_unit: "",
        title: "Requested C-state",
        descr: "The C-state requested from the OS idle subsystem before entering idle.",
    },
    Template {
        metric: "SilentTime",
        kind: Kind::Float,
        unit: Some(Unit::Microsecond),
        short_unit: "us",
        title: "Silent time",
        descr: "Time the CPU stayed idle before the armed wake event fired.",
    },
    Template {
        metric: "SilentTimeRaw",
        kind: Kind::Float,
        unit: Some(Unit::Microsecond),
        short_unit: "us",
        title: "Silent time (raw)",
        descr: "Silent time without the driver calibration adjustment.",
    },
    Template {
        metric: "WakeLatency",
        kind: Kind::Float,
        unit: Some(Unit::Microsecond),
        short_unit: "us",
        title: "Wake latency",
        descr: "Time from the armed wake event to the first instruction after idle.",
    },
    Template {
        metric: "WakeLatencyRaw",
        kind: Kind::Float,
        unit: Some(Unit::Microsecond),
        short_unit: "us",
        title: "Wake latency (raw)",
        descr: "Wake latency without adjustments and overhead compensation.",
    },
    Template {
        metric: "IntrLatency",
        kind: Kind::Float,
        unit: Some(Unit::Microsecond),
        short_unit: "us",
        title: "Interrupt latency",
        descr: "Time from the armed wake event to the interrupt handler.",
    },
    Template {
        metric: "IntrLatencyRaw",
        kind: Kind::Float,
        unit: Some(Unit::Microsecond),
        short_unit: "us",
        title: "Interrupt latency (raw)",
        descr: "Interrupt latency without adjustments and overhead compensation.",
    },
    Template {
        metric: "LDist",
        kind: Kind::Float,
        unit: Some(Unit::Microsecond),
        short_unit: "us",
        title: "Launch distance",
        descr: "How far in the future the wake event was armed, relative to idle entry.",
    },
    Template {
        metric: "IntrOff",
        kind: Kind::Bool,
        unit: None,
        short_unit: "",
        title: "Interrupts disabled",
        descr: "Whether the requested C-state was entered with local CPU interrupts disabled.",
    },
    Template {
        metric: "SMICnt",
        kind: Kind::Int,
        unit: Some(Unit::Count),
        short_unit: "",
        title: "SMI count",
        descr: "System management interrupts during the measurement window.",
    },
    Template {
        metric: "NMICnt",
        kind: Kind::Int,
        unit: Some(Unit::Count),
        short_unit: "",
        title: "NMI count",
        descr: "Non-maskable interrupts during the measurement window.",
    },
    Template {
        metric: "CC1Derived%",
        kind: Kind::Float,
        unit: Some(Unit::Percent),
        short_unit: "%",
        title: "CC1 residency (derived)",
        descr: "Software-derived CC1 residency: total cycles minus cycles spent in the other \
                core C-states. Useful on platforms without a hardware CC1 counter.",
    },
    Template {
        metric: "CCx%",
        kind: Kind::Float,
        unit: Some(Unit::Percent),
        short_unit: "%",
        title: "CCx residency",
        descr: "Time in percent the CPU spent in the CCx core C-state.",
    },
    Template {
        metric: "PCx%",
        kind: Kind::Float,
        unit: Some(Unit::Percent),
        short_unit: "%",
        title: "PCx residency",
        descr: "Time in percent the package spent in the PCx package C-state.",
    },
];

/// The expanded definitions dictionary for one measurement run.
#[derive(Debug, Clone)]
pub struct Defs {
    defs: Vec<MetricDef>,
    index: HashMap<String, usize>,
}

impl Defs {
    /// Build the definitions for a run, expanding `CCx` / `PCx` placeholders
    /// against the C-state cycle counters present in `raw_header`.
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(raw_header: I) -> Self {
        let mut ccnames: Vec<&str> = Vec::new();
        let mut pcnames: Vec<&str> = Vec::new();

        for metric in raw_header {
            if !is_cscyc_metric(metric) {
                continue;
            }
            let Some(csname) = csname_of(metric) else {
                continue;
            };
            if metric.starts_with("CC") && !ccnames.contains(&csname) {
                ccnames.push(csname);
            } else if metric.starts_with("PC") && !pcnames.contains(&csname) {
                pcnames.push(csname);
            }
        }

        let mut defs = Vec::new();
        for tmpl in TEMPLATES {
            if tmpl.metric.contains("CCx") {
                for csname in &ccnames {
                    defs.push(expand(tmpl, "CCx", csname));
                }
            } else if tmpl.metric.contains("PCx") {
                for csname in &pcnames {
                    defs.push(expand(tmpl, "PCx", csname));
                }
            } else {
                defs.push(expand(tmpl, "", ""));
            }
        }

        let index = defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.metric.clone(), i))
            .collect();

        Self { defs, index }
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.index.contains_key(metric)
    }

    pub fn get(&self, metric: &str) -> Option<&MetricDef> {
        self.index.get(metric).map(|&i| &self.defs[i])
    }

    /// Metric names in definition order.
    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.defs.iter().map(|d| d.metric.as_str())
    }

    pub fn unit(&self, metric: &str) -> Option<Unit> {
        self.get(metric).and_then(|d| d.unit)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

fn expand(tmpl: &Template, placeholder: &str, value: &str) -> MetricDef {
    let subst = |s: &str| {
        if placeholder.is_empty() {
            s.to_string()
        } else {
            s.replace(placeholder, value)
        }
    };
    MetricDef {
        metric: subst(tmpl.metric),
        kind: tmpl.kind,
        unit: tmpl.unit,
        short_unit: tmpl.short_unit,
        title: subst(tmpl.title),
        descr: subst(tmpl.descr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_HEADER: &[&str] = &[
        "ReqCState", "TotCyc", "CC0Cyc", "CC6Cyc", "PC2Cyc", "LTime", "TBI", "TAI",
    ];

    #[test]
    fn test_placeholder_expansion() {
        let defs = Defs::new(RAW_HEADER.iter().copied());
        assert!(defs.contains("CC0%"));
        assert!(defs.contains("CC6%"));
        assert!(defs.contains("PC2%"));
        assert!(!defs.contains("CCx%"));
        assert!(!defs.contains("PCx%"));
        assert_eq!(defs.get("CC6%").unwrap().title, "CC6 residency");
    }

    #[test]
    fn test_expansion_is_per_present_cstate_only() {
        let defs = Defs::new(["TotCyc", "CC0Cyc"]);
        assert!(defs.contains("CC0%"));
        assert!(!defs.contains("CC6%"));
        assert!(!defs.contains("PC2%"));
        // Exactly one CC residency entry.
        assert_eq!(defs.metrics().filter(|m| m.starts_with("CC0")).count(), 1);
    }

    #[test]
    fn test_units() {
        let defs = Defs::new(RAW_HEADER.iter().copied());
        assert_eq!(defs.unit("WakeLatency"), Some(Unit::Microsecond));
        assert_eq!(defs.unit("LDist"), Some(Unit::Microsecond));
        assert_eq!(defs.unit("CC6%"), Some(Unit::Percent));
        assert_eq!(defs.unit("IntrOff"), None);
        assert_eq!(defs.unit("NoSuchMetric"), None);
    }

    #[test]
    fn test_definition_order_is_stable() {
        let defs = Defs::new(RAW_HEADER.iter().copied());
        let metrics: Vec<&str> = defs.metrics().collect();
        let req = metrics.iter().position(|m| *m == "ReqCState").unwrap();
        let wake = metrics.iter().position(|m| *m == "WakeLatency").unwrap();
        let cc6 = metrics.iter().position(|m| *m == "CC6%").unwrap();
        let pc2 = metrics.iter().position(|m| *m == "PC2%").unwrap();
        assert!(req < wake && wake < cc6 && cc6 < pc2);
    }
}
