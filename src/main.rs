use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use usdtrace::decode::PayloadFormat;
use usdtrace::render::OutputFormat;
use usdtrace::Config;

/// Trace USDT probes of a running process and rebuild per-request bundles.
#[derive(Debug, Parser)]
#[command(name = "usdtrace", version)]
struct Command {
    /// Process to attach to
    pid: u32,
    /// JSON probe table
    #[arg(short, long)]
    probes: PathBuf,
    /// USDT provider for probes that don't name one
    #[arg(long)]
    provider: Option<String>,
    /// Fraction of probe firings to record, in (0, 1]
    #[arg(short, long)]
    sample: Option<f64>,
    /// Long-string chunk size in bytes
    #[arg(short = 'c', long)]
    chunk_size: Option<u32>,
    /// Number of long-string chunks
    #[arg(short = 'm', long)]
    chunk_count: Option<u32>,
    /// Write the report to this file instead of stdout
    #[arg(short = 'f', long)]
    output: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Group hits into operations by this argument (e.g. opCtx)
    #[arg(long)]
    correlate: Option<String>,
    /// Probes that complete a correlated operation
    #[arg(long)]
    close_on: Vec<String>,
    /// Argument that identifies a start/end span
    #[arg(long, default_value = "count")]
    counter_arg: String,
    /// Expire spans open for longer than this many milliseconds
    #[arg(long, default_value_t = 0)]
    stale_after_ms: u64,
    /// Keep at most this many hits per thread (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    max_hits_per_thread: usize,
    /// Instruction budget per generated program
    #[arg(long, default_value_t = usdtrace::codegen::DEFAULT_PROGRAM_BUDGET)]
    program_budget: usize,
    /// Decode long-string payloads as documents of this format
    #[arg(long, value_enum)]
    payloads: Option<PayloadFormat>,
    /// Print the generated programs and exit
    #[arg(long)]
    dump_source: bool,
    /// Trace for this many seconds (0 = until Ctrl-C)
    #[arg(short, long, default_value_t = 0)]
    duration: u64,
    /// clang binary
    #[arg(long, default_value = "clang")]
    clang: PathBuf,
    /// Extra include directory for clang
    #[arg(long)]
    bpf_include: Vec<PathBuf>,
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl From<Command> for Config {
    fn from(cmd: Command) -> Self {
        Config {
            verbosity: cmd.verbose,
            pid: cmd.pid,
            probes: cmd.probes,
            provider: cmd.provider,
            sampling: cmd.sample,
            chunk_size: cmd.chunk_size,
            chunk_count: cmd.chunk_count,
            output: cmd.output,
            format: cmd.format,
            correlate: cmd.correlate,
            close_on: cmd.close_on,
            counter_arg: cmd.counter_arg,
            stale_after_ms: cmd.stale_after_ms,
            max_hits_per_thread: cmd.max_hits_per_thread,
            program_budget: cmd.program_budget,
            payloads: cmd.payloads,
            dump_source: cmd.dump_source,
            duration: cmd.duration,
            clang: cmd.clang,
            bpf_include: cmd.bpf_include,
            ..Default::default()
        }
    }
}

fn main() -> Result<()> {
    let config = Config::from(Command::parse());

    let level = match config.verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    usdtrace::run(config)
}
