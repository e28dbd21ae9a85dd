//! Raw test result reading and writing.
//!
//! A raw test result is a directory with the following layout:
//! - `datapoints.csv` — one row per accepted processed datapoint. May be
//!   very large.
//! - `info.yml` — YAML sidecar with the run metadata (report ID, measured
//!   CPU, device, format version).
//! - `logs/`, `stats/` — optional, written by external collaborators.
//!
//! The CSV header is pinned by the first accepted datapoint; every later
//! row must carry exactly the same columns. The sidecar is written at run
//! start and rewritten on close with the duration appended; the write is
//! atomic (temp file + rename) so a crash never leaves a torn sidecar. A
//! run that produced no rows removes everything it created.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::datapoint::Datapoint;
use crate::error::{Error, Result};
use crate::filter::RowFilter;
use crate::human;

/// The raw result format version this crate writes.
pub const FORMAT_VERSION: &str = "1.3";

/// Format versions [`load_result`] accepts.
const READABLE_VERSIONS: &[&str] = &["1.3", "1.2"];

/// How many CSV rows to buffer before writing them out.
const CSV_BUF_ROWS: usize = 1024;

/// Run metadata stored in the `info.yml` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarInfo {
    pub toolname: String,
    pub toolver: String,
    pub format_version: String,
    pub reportid: String,
    pub cpu: u32,
    pub devid: String,
    pub devdescr: String,
    /// Device clock resolution in nanoseconds.
    pub resolution: u64,
    pub date: String,
    #[serde(default)]
    pub early_intr: bool,
    /// Total run duration, appended on close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl SidecarInfo {
    pub fn new(reportid: &str, cpu: u32) -> Self {
        Self {
            toolname: "wakelat".to_string(),
            toolver: crate::VERSION.to_string(),
            format_version: FORMAT_VERSION.to_string(),
            reportid: reportid.to_string(),
            cpu,
            devid: String::new(),
            devdescr: String::new(),
            resolution: 0,
            date: human::datetime_now(),
            early_intr: false,
            duration: None,
        }
    }
}

/// A write-only CSV file with a pinned header.
#[derive(Debug)]
struct WritableCsv {
    path: PathBuf,
    file: BufWriter<File>,
    header: Vec<String>,
    buffered: Vec<String>,
    rows: u64,
}

impl WritableCsv {
    fn create(path: &Path, header: Vec<String>) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        let mut csv = Self {
            path: path.to_path_buf(),
            file,
            header,
            buffered: Vec::new(),
            rows: 0,
        };
        csv.buffered.push(csv.header.join(","));
        log::debug!("CSV header: {}", csv.header.join(", "));
        Ok(csv)
    }

    fn add_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.header.len() {
            return Err(Error::Invariant {
                msg: format!(
                    "cannot add a row with {} fields to CSV file '{}' with {} header columns",
                    row.len(),
                    self.path.display(),
                    self.header.len()
                ),
            });
        }
        self.buffered.push(row.join(","));
        self.rows += 1;
        if self.buffered.len() >= CSV_BUF_ROWS {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for row in self.buffered.drain(..) {
            self.file.write_all(row.as_bytes())?;
            self.file.write_all(b"\n")?;
        }
        self.file.flush()?;
        Ok(())
    }
}

/// A write-only raw test result.
#[derive(Debug)]
pub struct RunResult {
    dirpath: PathBuf,
    csv_path: PathBuf,
    info_path: PathBuf,
    csv: Option<WritableCsv>,
    filter: RowFilter,
    /// Append rows that fail the filter anyway.
    pub keep_filtered: bool,
    pub info: SidecarInfo,
    created_paths: Vec<PathBuf>,
}

impl RunResult {
    /// Initialize the output directory for writing test results.
    ///
    /// An existing directory is accepted only if it does not already
    /// contain result files; everything this writer creates is recorded so
    /// an empty run can clean up after itself.
    pub fn new(outdir: &Path, info: SidecarInfo, filter: RowFilter) -> Result<Self> {
        let dirpath = outdir.to_path_buf();
        let csv_path = dirpath.join("datapoints.csv");
        let info_path = dirpath.join("info.yml");

        let mut created_paths = Vec::new();
        if dirpath.exists() {
            // Only accept an output directory without prior results.
            for path in [
                &csv_path,
                &info_path,
                &dirpath.join("logs"),
                &dirpath.join("stats"),
            ] {
                if path.exists() {
                    return Err(Error::ResultDirExists {
                        path: dirpath,
                        existing: path
                            .file_name()
                            .unwrap_or_default()
                            .to_string_lossy()
                            .into_owned(),
                    });
                }
            }
            created_paths.push(csv_path.clone());
            created_paths.push(info_path.clone());
        } else {
            fs::create_dir_all(&dirpath)?;
            log::info!("Created result directory '{}'", dirpath.display());
            created_paths.push(dirpath.clone());
        }

        Ok(Self {
            dirpath,
            csv_path,
            info_path,
            csv: None,
            filter,
            keep_filtered: false,
            info,
            created_paths,
        })
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    /// Rows written so far, excluding the header.
    pub fn rows(&self) -> u64 {
        self.csv.as_ref().map_or(0, |csv| csv.rows)
    }

    pub fn has_header(&self) -> bool {
        self.csv.is_some()
    }

    /// Pin the CSV header and bind the row filter against it. Creates the
    /// CSV file; called with the metric names of the first processed
    /// datapoint.
    pub fn set_header(&mut self, header: Vec<String>) -> Result<()> {
        debug_assert!(self.csv.is_none(), "CSV header set twice");
        self.filter.bind(&header)?;
        self.csv = Some(WritableCsv::create(&self.csv_path, header)?);
        Ok(())
    }

    /// Apply the row filter to a processed datapoint and possibly append it
    /// to the CSV file. Returns whether the datapoint passed the filter;
    /// with `keep_filtered` set, the row is appended regardless.
    pub fn add_row(&mut self, datapoint: &Datapoint) -> Result<bool> {
        let passed = self.filter.passes(datapoint)?;
        if !passed && !self.keep_filtered {
            return Ok(false);
        }

        let Some(csv) = &mut self.csv else {
            return Err(Error::Invariant {
                msg: "cannot add rows before the CSV header is set".to_string(),
            });
        };

        let mut row = Vec::with_capacity(csv.header.len());
        for column in &csv.header {
            let Some(value) = datapoint.get(column) else {
                return Err(Error::Invariant {
                    msg: format!(
                        "processed datapoint without the '{column}' CSV column:\n{}",
                        datapoint.dump()
                    ),
                });
            };
            // Two decimals are enough for percentages.
            if column.contains('%') {
                row.push(format!("{:.2}", value.as_float().unwrap_or(0.0)));
            } else {
                row.push(value.to_string());
            }
        }
        csv.add_row(row)?;
        Ok(passed)
    }

    /// Write the sidecar atomically: serialize to a temp file in the result
    /// directory, then rename over `info.yml`.
    pub fn write_info(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.info)?;
        let tmp_path = self.dirpath.join(".info.yml.tmp");
        fs::write(&tmp_path, yaml)?;
        fs::rename(&tmp_path, &self.info_path)?;
        Ok(())
    }

    /// Flush and close the result. A run with zero rows removes every path
    /// this writer created.
    pub fn close(mut self) -> Result<()> {
        let rows = self.rows();
        if let Some(csv) = &mut self.csv {
            csv.flush()?;
        }
        self.csv = None;

        if rows > 0 {
            return Ok(());
        }

        log::info!(
            "No data was collected, so the following paths will be deleted:\n  - {}",
            self.created_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n  - ")
        );
        for path in &self.created_paths {
            if !path.exists() {
                continue;
            }
            // Best-effort cleanup.
            let outcome = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            if let Err(err) = outcome {
                log::debug!("failed to remove '{}': {err}", path.display());
            }
        }
        Ok(())
    }
}

/// A raw test result loaded back from disk.
#[derive(Debug)]
pub struct LoadedResult {
    pub dirpath: PathBuf,
    pub info: SidecarInfo,
    /// The CSV header, empty when no datapoints were written.
    pub header: Vec<String>,
    /// Data row count, excluding the header.
    pub rows: u64,
}

/// Load the sidecar and CSV shape of a result directory.
pub fn load_result(dirpath: &Path) -> Result<LoadedResult> {
    let bad = |reason: String| Error::BadResult {
        path: dirpath.to_path_buf(),
        reason,
    };

    let info_text = fs::read_to_string(dirpath.join("info.yml"))
        .map_err(|err| bad(format!("cannot read info.yml: {err}")))?;
    let info: SidecarInfo = serde_yaml::from_str(&info_text)?;

    if !READABLE_VERSIONS.contains(&info.format_version.as_str()) {
        return Err(bad(format!(
            "unsupported format version '{}', supported versions are: {}",
            info.format_version,
            READABLE_VERSIONS.join(", ")
        )));
    }

    let csv = File::open(dirpath.join("datapoints.csv"))
        .map_err(|err| bad(format!("cannot read datapoints.csv: {err}")))?;
    let mut lines = BufReader::new(csv).lines();
    let header: Vec<String> = match lines.next() {
        Some(line) => line?.split(',').map(str::to_string).collect(),
        None => Vec::new(),
    };
    let mut rows = 0;
    for line in lines {
        line?;
        rows += 1;
    }

    Ok(LoadedResult {
        dirpath: dirpath.to_path_buf(),
        info,
        header,
        rows,
    })
}
