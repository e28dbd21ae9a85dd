//! `wakelat start` — run a wake latency measurement.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use wakelat_core::cpuidle::CStateDirectory;
use wakelat_core::process::{DatapointProcessor, ProcessorConfig};
use wakelat_core::provider::{DebugfsSource, RawSource, SourceConfig};
use wakelat_core::result::{RunResult, SidecarInfo};
use wakelat_core::runner::Runner;
use wakelat_core::{Result, RowFilter, human, reportid};

/// Exit code reported after a Ctrl-C that still produced data.
const EXIT_INTERRUPTED: i32 = 130;

/// Options of the start command, mirroring its CLI flags.
pub struct StartOptions {
    pub device: String,
    pub datapoints: u64,
    pub time_limit: Option<String>,
    pub cpu: u32,
    pub ldist: String,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub keep_filtered: bool,
    pub keep_raw_data: bool,
    pub tsc_cal_time: String,
    pub early_intr: bool,
    pub intr_focus: bool,
    pub dcbuf_size: Option<u64>,
    pub outdir: Option<String>,
    pub reportid: Option<String>,
}

/// Run the start command. Returns the process exit code.
pub fn run(options: StartOptions) -> i32 {
    match measure(options) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err}");
            1
        }
    }
}

fn measure(options: StartOptions) -> Result<i32> {
    if options.datapoints == 0 {
        log::error!("the datapoint count must be greater than zero");
        return Ok(1);
    }

    let reportid = match &options.reportid {
        Some(id) => {
            reportid::validate(id)?;
            id.clone()
        }
        None => reportid::generate(),
    };
    let outdir = options
        .outdir
        .as_ref()
        .map_or_else(|| PathBuf::from(&reportid), PathBuf::from);

    let ldist = human::parse_ldist(&options.ldist)?;
    let tsc_cal_time_ns = human::parse_duration_ns(&options.tsc_cal_time)?;
    let time_limit = options
        .time_limit
        .as_deref()
        .map(|text| human::parse_duration_ns(text).map(|ns| Duration::from_nanos(ns.max(0) as u64)))
        .transpose()?;

    let source = DebugfsSource::new(
        &options.device,
        SourceConfig {
            ldist,
            intr_focus: options.intr_focus,
            early_intr: options.early_intr,
            dcbuf_size: options.dcbuf_size,
            ..SourceConfig::default()
        },
    );
    log::info!(
        "Using device '{}': {}",
        source.device().devid,
        source.device().descr
    );

    let directory = CStateDirectory::for_cpu(options.cpu)?;
    let processor = DatapointProcessor::new(
        directory,
        ProcessorConfig {
            tsc_native: source.device().tsc_native(),
            early_intr: options.early_intr,
            keep_raw: options.keep_raw_data,
            tsc_cal_time_ns,
        },
    );

    let mut info = SidecarInfo::new(&reportid, options.cpu);
    info.early_intr = options.early_intr;
    let filter = RowFilter::new(options.include.clone(), options.exclude.clone());
    let mut result = RunResult::new(&outdir, info, filter)?;
    result.keep_filtered = options.keep_filtered;

    // Ctrl-C flips the cancellation flag; the run loop notices it between
    // datapoints and stops the producer.
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    }) {
        log::warn!("failed to set the Ctrl-C handler: {err}");
    }

    let mut runner = Runner::new(Box::new(source), processor, result, cancel);
    runner.prepare()?;
    let summary = runner.run(options.datapoints, time_limit)?;

    if summary.collected > 0 {
        println!(
            "Collected {} datapoints in {}, max. latency {:.2} us, results in '{}'",
            summary.collected,
            human::duration_secs(summary.duration_secs),
            summary.max_latency_us,
            outdir.display()
        );
    } else {
        log::warn!("no datapoints were collected");
    }

    if summary.interrupted {
        // An interrupted run that still produced data counts as a success
        // for reporting purposes.
        return Ok(if summary.collected > 0 { EXIT_INTERRUPTED } else { 1 });
    }
    Ok(if summary.collected > 0 { 0 } else { 1 })
}
