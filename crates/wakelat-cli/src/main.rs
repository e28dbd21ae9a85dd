//! CLI for wakelat — measure CPU wake-up and interrupt latency out of idle
//! states.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wakelat")]
#[command(about = "wakelat — measure CPU wake-up and interrupt latency out of idle states")]
#[command(version = wakelat_core::VERSION)]
struct Cli {
    /// Print debug-level messages.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start measuring wake latency on a CPU.
    Start {
        /// The delayed-event device to use: 'hrt' (high-resolution timer),
        /// 'tdt' (TSC deadline timer), or a network device ID.
        #[arg(long, default_value = "hrt")]
        device: String,

        /// How many datapoints to collect.
        #[arg(short = 'c', long = "datapoints", default_value_t = 1_000_000)]
        datapoints: u64,

        /// Measurement time limit, e.g. '30s', '10m' or '1h'.
        #[arg(long)]
        time_limit: Option<String>,

        /// The CPU to measure.
        #[arg(long, default_value_t = 0)]
        cpu: u32,

        /// Launch distance range in microseconds or with explicit units,
        /// e.g. '0,4000' or '10us,5ms'. '0' means the device minimum.
        #[arg(short, long, default_value = "0,4000")]
        ldist: String,

        /// Row filter: keep only datapoints matching this expression,
        /// e.g. 'CC6% > 0'.
        #[arg(long)]
        include: Option<String>,

        /// Row filter: drop datapoints matching this expression,
        /// e.g. 'WakeLatency > 100'.
        #[arg(long)]
        exclude: Option<String>,

        /// Write filtered-out datapoints to the CSV file too.
        #[arg(long)]
        keep_filtered: bool,

        /// Keep all raw datapoint fields in the CSV file.
        #[arg(long)]
        keep_raw_data: bool,

        /// Time to spend calculating the TSC rate for cycle-reporting
        /// backends, e.g. '10s'.
        #[arg(long, default_value = "10s")]
        tsc_cal_time: String,

        /// Enable interrupts before requesting the C-state.
        #[arg(long)]
        early_intr: bool,

        /// Focus on interrupt latency: skip the after-idle instrumentation.
        #[arg(long)]
        intr_focus: bool,

        /// Dirty this many bytes of CPU cache before requesting C-states.
        #[arg(long)]
        dcbuf_size: Option<u64>,

        /// Output directory for the result (default: the report ID).
        #[arg(short, long)]
        outdir: Option<String>,

        /// Report ID of the result (default: date-based).
        #[arg(long)]
        reportid: Option<String>,
    },

    /// List the requestable C-states of a CPU.
    Scan {
        /// The CPU to inspect.
        #[arg(long, default_value_t = 0)]
        cpu: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.debug { "debug" } else { "info" }),
    )
    .format_timestamp(None)
    .init();

    let exit_code = match cli.command {
        Commands::Start {
            device,
            datapoints,
            time_limit,
            cpu,
            ldist,
            include,
            exclude,
            keep_filtered,
            keep_raw_data,
            tsc_cal_time,
            early_intr,
            intr_focus,
            dcbuf_size,
            outdir,
            reportid,
        } => commands::start::run(commands::start::StartOptions {
            device,
            datapoints,
            time_limit,
            cpu,
            ldist,
            include,
            exclude,
            keep_filtered,
            keep_raw_data,
            tsc_cal_time,
            early_intr,
            intr_focus,
            dcbuf_size,
            outdir,
            reportid,
        }),
        Commands::Scan { cpu } => commands::scan::run(cpu),
    };

    std::process::exit(exit_code);
}
