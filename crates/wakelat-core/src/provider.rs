//! Raw datapoint providers.
//!
//! A provider arms the kernel producer, starts and stops the measurements,
//! and decodes the producer's line-oriented stream into raw datapoints. The
//! wire format is one `key=value` pair per line, with an empty line
//! terminating each datapoint record:
//!
//! ```text
//! ReqCState=2
//! TotCyc=1000000
//! CC0Cyc=10000
//! ...
//!
//! ```
//!
//! The kernel side exposes control knobs under a debugfs directory:
//! `enabled` (write "0"/"1"), `ldist_from_nsec` / `ldist_to_nsec` (the
//! launch-distance window, bounded by the read-only `ldist_min_nsec` /
//! `ldist_max_nsec`), `resolution_nsec`, and the optional `intr_focus`,
//! `early_intr` and `dcbuf_size` feature knobs.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::datapoint::{self as dp, Datapoint, Value};
use crate::error::{Error, Result};

/// Default debugfs directory of the kernel producer.
pub const DEFAULT_BASEDIR: &str = "/sys/kernel/debug/wakelat";

/// Metrics every raw datapoint must carry.
const REQUIRED_METRICS: &[&str] = &[
    dp::REQ_CSTATE,
    dp::TOT_CYC,
    dp::CC0_CYC,
    dp::BI_CYC,
    dp::BI_MONOTONIC,
    dp::LTIME,
    dp::TBI,
    dp::TAI,
    dp::TINTR,
    dp::AITS1,
    dp::AITS2,
    dp::INTR_TS1,
    dp::INTR_TS2,
    dp::SMI_CNT,
    dp::NMI_CNT,
];

/// The kind of delayed-event device backing the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Linux high-resolution timer.
    Hrt,
    /// Per-CPU TSC deadline timer. Reports time in TSC cycles.
    Tdt,
    /// A network card with a packet-send timer.
    Nic,
}

/// Description of the delayed-event device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Canonical device ID, e.g. `hrt` or a PCI address.
    pub devid: String,
    /// Human-readable device description.
    pub descr: String,
    /// Device clock resolution in nanoseconds.
    pub resolution_ns: u64,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    /// Build the device description for a device ID: the `hrt` and `tdt`
    /// timers are known by name, anything else is treated as a network
    /// device ID.
    pub fn detect(devid: &str) -> Self {
        let (kind, descr) = match devid {
            "hrt" => (DeviceKind::Hrt, "Linux high-resolution timer".to_string()),
            "tdt" => (DeviceKind::Tdt, "TSC deadline timer".to_string()),
            other => (DeviceKind::Nic, format!("delayed-event network device '{other}'")),
        };
        Self {
            devid: devid.to_string(),
            descr,
            resolution_ns: 1,
            kind,
        }
    }

    /// Whether the device reports time in TSC cycles.
    pub fn tsc_native(&self) -> bool {
        self.kind == DeviceKind::Tdt
    }
}

/// A provider of raw datapoints.
///
/// Providers yield a lazy, single-pass, finite sequence:
/// [`RawSource::next_datapoint`] returning `Ok(None)` is terminal.
pub trait RawSource {
    fn device(&self) -> &DeviceInfo;

    /// Bind the device and push the run configuration to the producer.
    fn prepare(&mut self) -> Result<()>;

    /// Start producing datapoints.
    fn start(&mut self) -> Result<()>;

    /// Stop producing datapoints. Must be idempotent.
    fn stop(&mut self) -> Result<()>;

    /// The next raw datapoint, or `None` at end of stream.
    fn next_datapoint(&mut self) -> Result<Option<Datapoint>>;
}

/// Decode one `key=value` record from the producer stream.
///
/// Skips leading empty lines, then reads pairs until the terminating empty
/// line. Returns `None` at a clean end of stream.
pub fn read_record<R: BufRead>(reader: &mut R) -> Result<Option<Datapoint>> {
    let mut datapoint = Datapoint::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            if datapoint.is_empty() {
                return Ok(None);
            }
            return Err(Error::producer(
                "the producer stream ended in the middle of a datapoint record",
            ));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if datapoint.is_empty() {
                continue;
            }
            return Ok(Some(datapoint));
        }

        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(Error::producer(format!(
                "bad producer line '{trimmed}': expected 'key=value'"
            )));
        };
        if !is_valid_key(key) {
            return Err(Error::producer(format!(
                "bad metric name '{key}' in the producer stream"
            )));
        }

        let value = if let Ok(int) = value.parse::<i64>() {
            Value::Int(int)
        } else if let Ok(float) = value.parse::<f64>() {
            Value::Float(float)
        } else {
            return Err(Error::producer(format!(
                "bad value '{value}' for metric '{key}' in the producer stream"
            )));
        };
        datapoint.set(key, value);
    }
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '%')
}

/// Check that a decoded datapoint carries every required metric.
pub fn validate_record(datapoint: &Datapoint) -> Result<()> {
    for metric in REQUIRED_METRICS {
        if !datapoint.contains(metric) {
            return Err(Error::producer(format!(
                "the producer emitted a datapoint without the required '{metric}' metric:\n{}",
                datapoint.dump()
            )));
        }
    }
    Ok(())
}

/// Run configuration pushed to the kernel producer during `prepare`.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Debugfs directory of the producer.
    pub basedir: PathBuf,
    /// Launch-distance window in nanoseconds; `0` means "use the device
    /// minimum".
    pub ldist: (i64, i64),
    /// Measure only `IntrLatency`, skipping the after-idle instrumentation.
    pub intr_focus: bool,
    /// Enable interrupts before requesting the C-state.
    pub early_intr: bool,
    /// Dirty this much CPU cache before requesting the C-state, bytes.
    pub dcbuf_size: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            basedir: PathBuf::from(DEFAULT_BASEDIR),
            ldist: (0, 0),
            intr_focus: false,
            early_intr: false,
            dcbuf_size: None,
        }
    }
}

/// The debugfs-backed raw datapoint provider.
#[derive(Debug)]
pub struct DebugfsSource {
    device: DeviceInfo,
    config: SourceConfig,
    reader: Option<BufReader<File>>,
    started: bool,
}

impl DebugfsSource {
    pub fn new(devid: &str, config: SourceConfig) -> Self {
        Self {
            device: DeviceInfo::detect(devid),
            config,
            reader: None,
            started: false,
        }
    }

    fn knob_path(&self, knob: &str) -> PathBuf {
        self.config.basedir.join(knob)
    }

    fn read_knob(&self, knob: &str) -> Result<String> {
        read_trimmed(&self.knob_path(knob))
    }

    fn write_knob(&self, knob: &str, value: &str) -> Result<()> {
        let path = self.knob_path(knob);
        fs::write(&path, value).map_err(|err| {
            Error::producer(format!("failed to write '{value}' to '{}': {err}", path.display()))
        })
    }

    fn read_knob_num(&self, knob: &str) -> Result<i64> {
        let text = self.read_knob(knob)?;
        text.parse().map_err(|_| {
            Error::producer(format!(
                "bad value '{text}' in '{}'",
                self.knob_path(knob).display()
            ))
        })
    }

    /// Validate the launch-distance window against the device bounds and
    /// push it to the producer.
    fn set_launch_distance(&mut self) -> Result<()> {
        let ldist_min = self.read_knob_num("ldist_min_nsec")?;
        let ldist_max = self.read_knob_num("ldist_max_nsec")?;

        let resolve = |ldist: i64| if ldist == 0 { ldist_min } else { ldist };
        let from = resolve(self.config.ldist.0);
        let to = resolve(self.config.ldist.1);

        for ldist in [from, to] {
            if ldist < ldist_min || ldist > ldist_max {
                return Err(Error::producer(format!(
                    "launch distance '{ldist}' is out of range, it should be within \
                     [{ldist_min},{ldist_max}] nanoseconds"
                )));
            }
        }

        self.write_knob("ldist_from_nsec", &from.to_string())?;
        self.write_knob("ldist_to_nsec", &to.to_string())?;
        self.config.ldist = (from, to);
        Ok(())
    }
}

impl RawSource for DebugfsSource {
    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn prepare(&mut self) -> Result<()> {
        if !self.config.basedir.is_dir() {
            return Err(Error::producer(format!(
                "no producer debugfs directory '{}' - is the wakelat driver loaded?",
                self.config.basedir.display()
            )));
        }

        // The producer is an exclusive resource: refuse to touch it while
        // another run has it enabled.
        if self.read_knob("enabled")? == "1" {
            return Err(Error::producer(format!(
                "the producer at '{}' is already enabled - another run in progress?",
                self.config.basedir.display()
            )));
        }

        self.device.resolution_ns = self.read_knob_num("resolution_nsec")? as u64;
        self.set_launch_distance()?;

        if self.config.intr_focus {
            self.write_knob("intr_focus", "1")?;
        }
        if self.config.early_intr {
            self.write_knob("early_intr", "1")?;
        }
        if let Some(size) = self.config.dcbuf_size {
            self.write_knob("dcbuf_size", &size.to_string())?;
        }

        log::info!(
            "Using device '{}' ({}), resolution {} ns, launch distance [{}, {}] ns",
            self.device.devid,
            self.device.descr,
            self.device.resolution_ns,
            self.config.ldist.0,
            self.config.ldist.1
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let path = self.knob_path("datapoints");
        let file = File::open(&path).map_err(|err| {
            Error::producer(format!("failed to open '{}': {err}", path.display()))
        })?;
        self.reader = Some(BufReader::new(file));
        self.write_knob("enabled", "1")?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.reader = None;
        self.write_knob("enabled", "0")
    }

    fn next_datapoint(&mut self) -> Result<Option<Datapoint>> {
        let Some(reader) = &mut self.reader else {
            return Err(Error::producer("the producer was not started"));
        };
        let Some(datapoint) = read_record(reader)? else {
            return Ok(None);
        };
        validate_record(&datapoint)?;
        Ok(Some(datapoint))
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|err| Error::producer(format!("failed to read '{}': {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_record() {
        let text = "ReqCState=2\nTotCyc=1000000\nWakeShare=0.25\n\nReqCState=0\n\n";
        let mut reader = Cursor::new(text);

        let first = read_record(&mut reader).unwrap().unwrap();
        let names: Vec<&str> = first.names().collect();
        assert_eq!(names, vec!["ReqCState", "TotCyc", "WakeShare"]);
        assert_eq!(first.int("ReqCState"), Some(2));
        assert_eq!(first.float("WakeShare"), Some(0.25));

        let second = read_record(&mut reader).unwrap().unwrap();
        assert_eq!(second.int("ReqCState"), Some(0));

        assert!(read_record(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_read_record_skips_leading_blank_lines() {
        let mut reader = Cursor::new("\n\nLTime=5\n\n");
        let datapoint = read_record(&mut reader).unwrap().unwrap();
        assert_eq!(datapoint.int("LTime"), Some(5));
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let mut reader = Cursor::new("LTime=5\nTBI=3\n");
        assert!(read_record(&mut reader).is_err());
    }

    #[test]
    fn test_malformed_lines_are_errors() {
        let mut reader = Cursor::new("LTime 5\n\n");
        assert!(read_record(&mut reader).is_err());

        let mut reader = Cursor::new("2Time=5\n\n");
        assert!(read_record(&mut reader).is_err());

        let mut reader = Cursor::new("LTime=five\n\n");
        assert!(read_record(&mut reader).is_err());
    }

    #[test]
    fn test_percent_keys_are_valid() {
        let mut reader = Cursor::new("CC6%=12.5\n\n");
        let datapoint = read_record(&mut reader).unwrap().unwrap();
        assert_eq!(datapoint.float("CC6%"), Some(12.5));
    }

    #[test]
    fn test_validate_record() {
        let mut datapoint = Datapoint::new();
        for metric in REQUIRED_METRICS {
            datapoint.set(metric, Value::Int(1));
        }
        assert!(validate_record(&datapoint).is_ok());

        datapoint.remove(dp::TINTR);
        assert!(validate_record(&datapoint).is_err());
    }

    #[test]
    fn test_device_detection() {
        let hrt = DeviceInfo::detect("hrt");
        assert_eq!(hrt.kind, DeviceKind::Hrt);
        assert!(!hrt.tsc_native());

        let tdt = DeviceInfo::detect("tdt");
        assert_eq!(tdt.kind, DeviceKind::Tdt);
        assert!(tdt.tsc_native());

        let nic = DeviceInfo::detect("0000:01:00.0");
        assert_eq!(nic.kind, DeviceKind::Nic);
    }

    #[test]
    fn test_prepare_refuses_enabled_producer() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("enabled"), "1\n").unwrap();

        let config = SourceConfig {
            basedir: tmp.path().to_path_buf(),
            ..SourceConfig::default()
        };
        let mut source = DebugfsSource::new("hrt", config);
        let err = source.prepare().unwrap_err();
        assert!(matches!(err, Error::Producer { .. }));
    }

    #[test]
    fn test_prepare_pushes_launch_distance() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        fs::write(base.join("enabled"), "0").unwrap();
        fs::write(base.join("resolution_nsec"), "1").unwrap();
        fs::write(base.join("ldist_min_nsec"), "100").unwrap();
        fs::write(base.join("ldist_max_nsec"), "10000000").unwrap();

        let config = SourceConfig {
            basedir: base.to_path_buf(),
            ldist: (0, 4_000_000),
            ..SourceConfig::default()
        };
        let mut source = DebugfsSource::new("hrt", config);
        source.prepare().unwrap();

        // '0' resolves to the device minimum.
        assert_eq!(fs::read_to_string(base.join("ldist_from_nsec")).unwrap(), "100");
        assert_eq!(
            fs::read_to_string(base.join("ldist_to_nsec")).unwrap(),
            "4000000"
        );

        // Out-of-range values are refused.
        let config = SourceConfig {
            basedir: base.to_path_buf(),
            ldist: (0, 20_000_000),
            ..SourceConfig::default()
        };
        let mut source = DebugfsSource::new("hrt", config);
        assert!(source.prepare().is_err());
    }
}
