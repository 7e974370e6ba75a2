//! Attaching probe programs and running their event loops.
//!
//! Probes are planned into programs, and each program gets a dedicated worker thread. The
//! worker compiles, loads and attaches its program, reports readiness back to [`Pipeline::attach`]
//! and then polls until the shared stop flag is raised. Decoded hits are handed to a
//! [`HitSink`]; lost events are counted in a [`DropCounter`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};

use crate::backend::{AttachError, LoadedProgram, TraceBackend};
use crate::codegen::{self, CompiledProgram, DEFAULT_PROGRAM_BUDGET};
use crate::decode::{DecodeError, Decoder, PayloadDecoder};
use crate::hit::ProbeHit;
use crate::spec::ProbeSpec;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_PROVIDER: &str = "mongodb";

/// Consumer of decoded hits. Called from worker threads.
pub trait HitSink: Send + Sync {
    fn on_hit(&self, hit: ProbeHit);

    fn on_decode_error(&self, probe: &str, err: &DecodeError) {
        debug!("{}: failed to decode event: {}", probe, err);
    }
}

/// Lost events, per probe and overall.
#[derive(Debug, Default)]
pub struct DropCounter {
    total: AtomicU64,
    per_probe: DashMap<String, u64>,
}

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, probe: &str, count: u64) {
        self.total.fetch_add(count, Ordering::Relaxed);
        *self.per_probe.entry(probe.to_string()).or_insert(0) += count;
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn for_probe(&self, probe: &str) -> u64 {
        self.per_probe.get(probe).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.per_probe
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// How long one poll may block.
    pub poll_timeout: Duration,
    /// Instruction budget per program used for planning.
    pub program_budget: usize,
    /// Provider for probes that don't name one.
    pub provider: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            program_budget: DEFAULT_PROGRAM_BUDGET,
            provider: DEFAULT_PROVIDER.to_string(),
        }
    }
}

pub struct Pipeline {
    backend: Arc<dyn TraceBackend>,
    sink: Arc<dyn HitSink>,
    drops: Arc<DropCounter>,
    payload: Option<Arc<dyn PayloadDecoder>>,
    options: PipelineOptions,
}

/// Running workers. Dropping the handle stops them.
pub struct AttachHandle {
    stop: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    programs: Vec<Vec<String>>,
}

impl AttachHandle {
    /// Probe names grouped by the program they were loaded in.
    pub fn programs(&self) -> &[Vec<String>] {
        &self.programs
    }

    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| !w.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("probe worker panicked");
            }
        }
    }
}

impl Drop for AttachHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn TraceBackend>,
        sink: Arc<dyn HitSink>,
        drops: Arc<DropCounter>,
        options: PipelineOptions,
    ) -> Self {
        Pipeline {
            backend,
            sink,
            drops,
            payload: None,
            options,
        }
    }

    pub fn with_payload_decoder(mut self, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.payload = Some(decoder);
        self
    }

    /// Attach `specs` to the process `pid`. Either every probe is attached and polled, or
    /// nothing is left running and the first fatal error is returned.
    pub fn attach(&self, pid: u32, specs: &[Arc<ProbeSpec>]) -> Result<AttachHandle, AttachError> {
        let mut handle = AttachHandle {
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            programs: Vec::new(),
        };

        let mut queue: VecDeque<Vec<Arc<ProbeSpec>>> =
            codegen::plan_programs(specs, self.options.program_budget).into();
        while let Some(group) = queue.pop_front() {
            match self.spawn_worker(pid, &group, handle.workers.len(), &handle.stop) {
                Ok(worker) => {
                    handle
                        .programs
                        .push(group.iter().map(|s| s.name().to_string()).collect());
                    handle.workers.push(worker);
                }
                Err(AttachError::LimitExceeded(msg)) if group.len() > 1 => {
                    warn!(
                        "Program with {} probes is too large ({}), splitting it",
                        group.len(),
                        msg
                    );
                    let mut left = group;
                    let right = left.split_off(left.len() / 2);
                    queue.push_front(right);
                    queue.push_front(left);
                }
                Err(err) => {
                    handle.shutdown();
                    return Err(err);
                }
            }
        }
        Ok(handle)
    }

    fn spawn_worker(
        &self,
        pid: u32,
        group: &[Arc<ProbeSpec>],
        n: usize,
        stop: &Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>, AttachError> {
        let program = codegen::generate(group)?;
        let (ready_tx, ready_rx) = sync_channel(1);

        let backend = self.backend.clone();
        let sink = self.sink.clone();
        let drops = self.drops.clone();
        let payload = self.payload.clone();
        let provider = self.options.provider.clone();
        let timeout = self.options.poll_timeout;
        let stop = stop.clone();

        let worker = thread::Builder::new()
            .name(format!("usdt_poll_{n}"))
            .spawn(move || {
                let setup = WorkerSetup {
                    backend: backend.as_ref(),
                    sink,
                    drops,
                    payload,
                    provider: &provider,
                };
                let mut loaded = match setup.run(&program, pid) {
                    Ok(loaded) => {
                        let _ = ready_tx.send(Ok(()));
                        loaded
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while !stop.load(Ordering::Relaxed) {
                    if let Err(err) = loaded.poll(timeout) {
                        error!("Polling probe events failed: {}", err);
                        break;
                    }
                }
                loaded.cleanup();
                debug!("usdt_poll_{} exiting", n);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                Err(AttachError::WorkerLost)
            }
        }
    }
}

struct WorkerSetup<'a> {
    backend: &'a dyn TraceBackend,
    sink: Arc<dyn HitSink>,
    drops: Arc<DropCounter>,
    payload: Option<Arc<dyn PayloadDecoder>>,
    provider: &'a str,
}

impl WorkerSetup<'_> {
    fn run(
        self,
        program: &CompiledProgram,
        pid: u32,
    ) -> Result<Box<dyn LoadedProgram>, AttachError> {
        let mut image = self.backend.compile(program)?;
        for probe in program.probes() {
            let provider = probe.spec().provider().unwrap_or(self.provider);
            image.enable(provider, probe.name(), probe.entry())?;
        }

        let mut loaded = image.load(pid)?;
        if let Err(err) = self.open_streams(program, loaded.as_mut()) {
            loaded.cleanup();
            return Err(err);
        }
        info!(
            "Loaded program with probes: {}",
            program
                .probes()
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(loaded)
    }

    fn open_streams(
        &self,
        program: &CompiledProgram,
        loaded: &mut dyn LoadedProgram,
    ) -> Result<(), AttachError> {
        for probe in program.probes() {
            let chunks = match probe.chunk_store() {
                Some(store) => Some(loaded.chunk_source(store)?),
                None => None,
            };
            let decoder = Decoder::new(probe.clone(), chunks, self.payload.clone());

            let sink = self.sink.clone();
            let on_event = Box::new(move |cpu: i32, data: &[u8]| {
                match decoder.decode(cpu, data) {
                    Ok(hit) => sink.on_hit(hit),
                    Err(err) => sink.on_decode_error(decoder.probe(), &err),
                }
            });

            let drops = self.drops.clone();
            let name = probe.name().to_string();
            let on_drop = Box::new(move |cpu: i32, count: u64| {
                warn!("Lost {} events for {} on cpu {}", count, name, cpu);
                drops.record(&name, count);
            });

            loaded.open_event_stream(probe.channel(), on_event, on_drop)?;
        }
        Ok(())
    }
}
