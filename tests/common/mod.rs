//! A scripted in-memory backend for driving the pipeline without a kernel.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use usdtrace::backend::{
    AttachError, DropCallback, EventCallback, LoadedProgram, ProgramImage, TraceBackend,
};
use usdtrace::chunks::{ChunkGeometry, ChunkRing, ChunkSource};
use usdtrace::codegen::{CompiledProgram, FieldKind, ProbeProgram};

#[derive(Debug, Clone)]
pub enum Field {
    Int(i64),
    UInt(u64),
    Str(String),
    /// Long-string payload written through the chunk ring.
    Payload(Vec<u8>),
    /// Long-string failure sentinel.
    Sentinel(i32),
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Hit {
        probe: String,
        tid: u32,
        ns: u64,
        fields: Vec<(String, Field)>,
    },
    Raw {
        probe: String,
        data: Vec<u8>,
    },
    Lost {
        probe: String,
        count: u64,
    },
}

impl Scripted {
    pub fn hit(probe: &str, tid: u32, ns: u64, fields: &[(&str, Field)]) -> Self {
        Scripted::Hit {
            probe: probe.to_string(),
            tid,
            ns,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn probe(&self) -> &str {
        match self {
            Scripted::Hit { probe, .. } | Scripted::Raw { probe, .. } | Scripted::Lost { probe, .. } => {
                probe
            }
        }
    }
}

#[derive(Default)]
pub struct ScriptedBackend {
    pub events: Vec<Scripted>,
    /// Loads of programs with more probes than this fail with LimitExceeded.
    pub max_probes_per_program: Option<usize>,
    /// Loads of programs containing this probe are rejected by the "verifier".
    pub reject: Option<String>,
    /// Opening the event stream of this probe fails after the program loaded.
    pub broken_stream: Option<String>,
    pub compiled: Mutex<Vec<Vec<String>>>,
    pub loaded: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
}

impl TraceBackend for ScriptedBackend {
    fn compile(&self, program: &CompiledProgram) -> Result<Box<dyn ProgramImage>, AttachError> {
        let names: Vec<String> = program.probes().iter().map(|p| p.name().to_string()).collect();
        self.compiled.lock().unwrap().push(names);
        Ok(Box::new(ScriptedImage {
            probes: program.probes().to_vec(),
            enabled: Vec::new(),
            events: self.events.clone(),
            max_probes: self.max_probes_per_program,
            reject: self.reject.clone(),
            broken_stream: self.broken_stream.clone(),
            loaded: self.loaded.clone(),
            cleanups: self.cleanups.clone(),
        }))
    }
}

struct ScriptedImage {
    probes: Vec<ProbeProgram>,
    enabled: Vec<String>,
    events: Vec<Scripted>,
    max_probes: Option<usize>,
    reject: Option<String>,
    broken_stream: Option<String>,
    loaded: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

impl ProgramImage for ScriptedImage {
    fn enable(&mut self, provider: &str, probe: &str, entry: &str) -> Result<(), AttachError> {
        if !self.probes.iter().any(|p| p.entry() == entry) {
            return Err(AttachError::Enable {
                provider: provider.to_string(),
                probe: probe.to_string(),
                reason: format!("no entry {entry}"),
            });
        }
        self.enabled.push(probe.to_string());
        Ok(())
    }

    fn load(self: Box<Self>, _pid: u32) -> Result<Box<dyn LoadedProgram>, AttachError> {
        if let Some(max) = self.max_probes {
            if self.probes.len() > max {
                return Err(AttachError::LimitExceeded(format!(
                    "{} probes",
                    self.probes.len()
                )));
            }
        }
        if let Some(reject) = &self.reject {
            if self.probes.iter().any(|p| p.name() == reject) {
                return Err(AttachError::VerifierRejected(reject.clone()));
            }
        }
        self.loaded.fetch_add(1, Ordering::SeqCst);

        let mut rings = HashMap::new();
        for probe in &self.probes {
            if let Some(store) = probe.chunk_store() {
                let geometry = ChunkGeometry {
                    size: probe.spec().chunk_size(),
                    count: probe.spec().chunk_count(),
                };
                rings.insert(
                    store.to_string(),
                    Rc::new(RefCell::new(ChunkRing::new(geometry))),
                );
            }
        }
        let broken_channel = self
            .broken_stream
            .as_deref()
            .and_then(|name| self.probes.iter().find(|p| p.name() == name))
            .map(|p| p.channel().to_string());
        let pending = self
            .events
            .iter()
            .filter(|e| self.enabled.iter().any(|p| p == e.probe()))
            .cloned()
            .collect();
        Ok(Box::new(ScriptedLoaded {
            probes: self.probes,
            streams: HashMap::new(),
            rings,
            pending,
            broken_channel,
            cleanups: self.cleanups,
        }))
    }
}

struct SharedRing(Rc<RefCell<ChunkRing>>);

impl ChunkSource for SharedRing {
    fn read_chunk(&self, index: u32) -> Option<Vec<u8>> {
        self.0.borrow().read_chunk(index)
    }
}

struct ScriptedLoaded {
    probes: Vec<ProbeProgram>,
    streams: HashMap<String, (EventCallback, DropCallback)>,
    rings: HashMap<String, Rc<RefCell<ChunkRing>>>,
    pending: VecDeque<Scripted>,
    broken_channel: Option<String>,
    cleanups: Arc<AtomicUsize>,
}

impl LoadedProgram for ScriptedLoaded {
    fn open_event_stream(
        &mut self,
        channel: &str,
        on_event: EventCallback,
        on_drop: DropCallback,
    ) -> Result<(), AttachError> {
        if self.broken_channel.as_deref() == Some(channel) {
            return Err(AttachError::EventStream {
                channel: channel.to_string(),
                reason: "no such map".to_string(),
            });
        }
        self.streams
            .insert(channel.to_string(), (on_event, on_drop));
        Ok(())
    }

    fn chunk_source(&self, store: &str) -> Result<Box<dyn ChunkSource>, AttachError> {
        let ring = self
            .rings
            .get(store)
            .ok_or_else(|| AttachError::ChunkStore(store.to_string()))?;
        Ok(Box::new(SharedRing(ring.clone())))
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), AttachError> {
        if self.pending.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(());
        }
        while let Some(event) = self.pending.pop_front() {
            let Some(program) = self.probes.iter().find(|p| p.name() == event.probe()) else {
                continue;
            };
            let ring = program.chunk_store().and_then(|s| self.rings.get(s)).cloned();
            let Some((on_event, on_drop)) = self.streams.get_mut(program.channel()) else {
                continue;
            };
            match &event {
                Scripted::Hit { tid, ns, fields, .. } => {
                    let data = encode(program, *tid, *ns, fields, ring.as_deref());
                    on_event(0, &data);
                }
                Scripted::Raw { data, .. } => on_event(0, data),
                Scripted::Lost { count, .. } => on_drop(0, *count),
            }
        }
        Ok(())
    }

    fn cleanup(self: Box<Self>) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Build a raw record for `program` the way the generated code lays it out.
pub fn encode(
    program: &ProbeProgram,
    tid: u32,
    ns: u64,
    fields: &[(String, Field)],
    ring: Option<&RefCell<ChunkRing>>,
) -> Vec<u8> {
    let layout = program.layout();
    let mut data = vec![0u8; layout.size()];
    data[..6].copy_from_slice(b"mongod");
    data[16..20].copy_from_slice(&4242u32.to_ne_bytes());
    data[20..24].copy_from_slice(&tid.to_ne_bytes());
    data[24..32].copy_from_slice(&ns.to_ne_bytes());

    let mut put = |name: &str, bytes: &[u8]| {
        let field = layout
            .field(name)
            .unwrap_or_else(|| panic!("no field {name}"));
        data[field.offset..field.offset + bytes.len()].copy_from_slice(bytes);
    };

    for (name, value) in fields {
        let kind = layout.field(name).map(|f| f.kind);
        match value {
            Field::Int(v) => match kind {
                Some(FieldKind::I8) => put(name, &(*v as i8).to_ne_bytes()),
                Some(FieldKind::I32) => put(name, &(*v as i32).to_ne_bytes()),
                _ => put(name, &v.to_ne_bytes()),
            },
            Field::UInt(v) => put(name, &v.to_ne_bytes()),
            Field::Str(s) => {
                let Some(FieldKind::Bytes(n)) = kind else {
                    panic!("{name} is not a string field");
                };
                let bytes = s.as_bytes();
                put(name, &bytes[..bytes.len().min(n - 1)]);
            }
            Field::Payload(payload) => {
                let ring = ring.expect("probe has no chunk ring");
                let (sz, idx) = ring.borrow_mut().write(payload);
                put(&format!("{name}_sz"), &sz.to_ne_bytes());
                put(&format!("{name}_idx"), &idx.to_ne_bytes());
            }
            Field::Sentinel(v) => put(&format!("{name}_sz"), &v.to_ne_bytes()),
        }
    }
    data
}

/// Poll `cond` until it holds or five seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
