use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::Serialize;

use crate::arena::{OpArena, OpRecord};
use crate::backend::TraceBackend;
use crate::bundle::{reconstruct, Bundle, BundleOptions, DEFAULT_COUNTER_ARG};
use crate::codegen::{self, DEFAULT_PROGRAM_BUDGET};
use crate::decode::{DecodeError, PayloadDecoder, PayloadFormat};
use crate::hit::ProbeHit;
use crate::libbpf_backend::{LibbpfBackend, DEFAULT_PERF_PAGES};
use crate::pipeline::{
    AttachHandle, DropCounter, HitSink, Pipeline, PipelineOptions, DEFAULT_PROVIDER,
};
use crate::render::{render, OutputFormat};
use crate::spec::{ProbeSpec, ProbeTable, TuningOverrides};
use crate::stats::{Stats, Summary};
use crate::store::HitStore;

const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

/// Runtime options of a tracing session, separated from the CLI parsing concerns.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// Process to attach to
    pub pid: u32,
    /// JSON probe table
    pub probes: PathBuf,
    /// USDT provider for probes that don't name one
    pub provider: Option<String>,
    /// Sampling fraction for probes that don't set one
    pub sampling: Option<f64>,
    /// Long-string chunk size for probes that don't set one
    pub chunk_size: Option<u32>,
    /// Long-string chunk count for probes that don't set one
    pub chunk_count: Option<u32>,
    /// Where to write the report (stdout if unset)
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
    /// Argument used to correlate hits of one operation
    pub correlate: Option<String>,
    /// Probes that complete a correlated operation
    pub close_on: Vec<String>,
    /// Argument identifying a start/end span
    pub counter_arg: String,
    /// Expire spans open longer than this (0 = never)
    pub stale_after_ms: u64,
    /// Hits kept per thread (0 = unbounded)
    pub max_hits_per_thread: usize,
    /// Instruction budget per generated program
    pub program_budget: usize,
    /// Poll timeout in milliseconds
    pub poll_timeout_ms: u64,
    /// Decode long-string payloads as documents of this format
    pub payloads: Option<PayloadFormat>,
    /// Print the generated programs and exit
    pub dump_source: bool,
    /// Trace for this many seconds (0 = until Ctrl-C)
    pub duration: u64,
    /// clang used to build programs
    pub clang: PathBuf,
    /// Extra include directories for clang
    pub bpf_include: Vec<PathBuf>,
    /// Perf buffer pages per CPU
    pub perf_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            pid: 0,
            probes: PathBuf::new(),
            provider: None,
            sampling: None,
            chunk_size: None,
            chunk_count: None,
            output: None,
            format: OutputFormat::Text,
            correlate: None,
            close_on: Vec::new(),
            counter_arg: DEFAULT_COUNTER_ARG.to_string(),
            stale_after_ms: 0,
            max_hits_per_thread: 0,
            program_budget: DEFAULT_PROGRAM_BUDGET,
            poll_timeout_ms: 100,
            payloads: None,
            dump_source: false,
            duration: 0,
            clang: PathBuf::from("clang"),
            bpf_include: Vec::new(),
            perf_pages: DEFAULT_PERF_PAGES,
        }
    }
}

impl Config {
    pub fn overrides(&self) -> TuningOverrides {
        TuningOverrides {
            sampling: self.sampling,
            chunk_size: self.chunk_size,
            chunk_count: self.chunk_count,
        }
    }

    pub fn payload_decoder(&self) -> Option<Arc<dyn PayloadDecoder>> {
        self.payloads.map(PayloadFormat::decoder)
    }

    pub fn bundle_options(&self) -> BundleOptions {
        BundleOptions {
            counter_arg: self.counter_arg.clone(),
            stale_after_ns: (self.stale_after_ms > 0).then(|| self.stale_after_ms * 1_000_000),
        }
    }
}

pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB. This is required for BPF programs.",
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadReport {
    pub tid: u32,
    pub hits: usize,
    pub reordered: u64,
    pub evicted: u64,
    pub bundles: Vec<Bundle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub threads: Vec<ThreadReport>,
    /// Correlated operations, completed ones first.
    pub operations: Vec<OpRecord>,
    pub summary: Summary,
}

/// State shared between the probe workers and the thread that reports on them.
pub struct Session {
    store: HitStore,
    stats: Mutex<Stats>,
    drops: Arc<DropCounter>,
    arena: Option<OpArena>,
    close_on: Vec<String>,
    completed: Mutex<Vec<OpRecord>>,
    bundle_options: BundleOptions,
    payload: Option<Arc<dyn PayloadDecoder>>,
}

impl Session {
    pub fn new(config: &Config) -> Self {
        Session {
            store: HitStore::new(config.max_hits_per_thread),
            stats: Mutex::new(Stats::new()),
            drops: Arc::new(DropCounter::new()),
            arena: config.correlate.as_deref().map(OpArena::new),
            close_on: config.close_on.clone(),
            completed: Mutex::new(Vec::new()),
            bundle_options: config.bundle_options(),
            payload: config.payload_decoder(),
        }
    }

    pub fn store(&self) -> &HitStore {
        &self.store
    }

    pub fn drops(&self) -> &Arc<DropCounter> {
        &self.drops
    }

    /// A pipeline feeding this session.
    pub fn pipeline(
        self: &Arc<Self>,
        backend: Arc<dyn TraceBackend>,
        options: PipelineOptions,
    ) -> Pipeline {
        let pipeline = Pipeline::new(backend, self.clone(), self.drops.clone(), options);
        match &self.payload {
            Some(decoder) => pipeline.with_payload_decoder(decoder.clone()),
            None => pipeline,
        }
    }

    /// Reconstruct bundles and compute the summary from everything recorded so far.
    pub fn finish(&self) -> Report {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut threads = Vec::new();
        for (tid, history) in self.store.snapshot() {
            stats.absorb_history(tid, history.iter());
            threads.push(ThreadReport {
                tid,
                hits: history.len(),
                reordered: history.reordered(),
                evicted: history.dropped(),
                bundles: reconstruct(history.hits(), &self.bundle_options),
            });
        }

        let mut operations = self
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(arena) = &self.arena {
            operations.extend(arena.clear());
        }

        Report {
            threads,
            operations,
            summary: stats.summary(&self.drops),
        }
    }
}

impl HitSink for Session {
    fn on_hit(&self, hit: ProbeHit) {
        let hit = Arc::new(hit);
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&hit);

        if let Some(arena) = &self.arena {
            if let Some(op) = arena.record(&hit) {
                if self.close_on.iter().any(|p| *p == hit.probe) {
                    if let Some(record) = arena.take(op) {
                        debug!("Operation {:#x} complete with {} hits", op, record.hits.len());
                        self.completed
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(record);
                    }
                }
            }
        }

        self.store.insert(hit);
    }

    fn on_decode_error(&self, probe: &str, err: &DecodeError) {
        debug!("{}: failed to decode event: {}", probe, err);
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_decode_failure(probe, err);
    }
}

fn dump_source(specs: &[Arc<ProbeSpec>], budget: usize) -> Result<()> {
    for (i, group) in codegen::plan_programs(specs, budget).iter().enumerate() {
        let program = codegen::generate(group)?;
        println!("// program {i}");
        println!("{}", program.source());
    }
    Ok(())
}

fn wait_for_stop(duration: u64) -> Result<()> {
    if duration > 0 {
        println!("Tracing for {duration} seconds");
        thread::sleep(Duration::from_secs(duration));
        return Ok(());
    }

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install the Ctrl-C handler")?;
    println!("Tracing, Ctrl-C to stop");
    let _ = stop_rx.recv();
    Ok(())
}

fn write_report(report: &Report, format: OutputFormat, output: Option<&Path>) -> Result<()> {
    let rendered = render(report, format)?;
    match output {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("Failed to write report to {}", path.display())),
        None => {
            print!("{rendered}");
            Ok(())
        }
    }
}

/// Attach to `config.pid`, trace until stopped and write the report.
pub fn run(config: Config) -> Result<()> {
    let table = ProbeTable::load(&config.probes, &config.overrides())?;
    if table.probes.is_empty() {
        bail!("Probe table {} has no probes", config.probes.display());
    }

    if config.dump_source {
        return dump_source(&table.probes, config.program_budget);
    }

    if !Path::new(&format!("/proc/{}", config.pid)).exists() {
        bail!("Process {} is not running", config.pid);
    }

    bump_memlock_rlimit()?;

    let provider = config
        .provider
        .clone()
        .or(table.provider.clone())
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
    let backend = Arc::new(LibbpfBackend {
        clang: config.clang.clone(),
        include_dirs: config.bpf_include.clone(),
        perf_pages: config.perf_pages,
    });
    let options = PipelineOptions {
        poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        program_budget: config.program_budget,
        provider,
    };

    let session = Arc::new(Session::new(&config));
    let pipeline = session.pipeline(backend, options);
    let handle: AttachHandle = pipeline
        .attach(config.pid, &table.probes)
        .with_context(|| format!("Failed to attach to pid {}", config.pid))?;
    info!(
        "Attached {} probes in {} programs",
        table.probes.len(),
        handle.programs().len()
    );

    wait_for_stop(config.duration)?;
    handle.stop();

    let report = session.finish();
    write_report(&report, config.format, config.output.as_deref())
}
