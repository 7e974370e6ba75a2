//! The seam between the tracer and whatever compiles, loads and attaches the generated programs.
//!
//! The pipeline only talks to these traits. [`crate::libbpf_backend`] is the production
//! implementation; tests drive the pipeline with a scripted in-memory one. Everything behind
//! [`TraceBackend::compile`] is created and used on the worker thread that owns the program, so
//! only the backend itself has to be `Send + Sync`.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::chunks::ChunkSource;
use crate::codegen::{CodegenError, CompiledProgram};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error("failed to compile program: {0}")]
    Compile(String),
    #[error("failed to enable probe {provider}:{probe}: {reason}")]
    Enable {
        provider: String,
        probe: String,
        reason: String,
    },
    #[error("program rejected by the verifier: {0}")]
    VerifierRejected(String),
    #[error("program exceeds the kernel's size limits: {0}")]
    LimitExceeded(String),
    #[error("failed to load program: {0}")]
    Load(String),
    #[error("failed to open event stream {channel}: {reason}")]
    EventStream { channel: String, reason: String },
    #[error("program has no chunk store named {0}")]
    ChunkStore(String),
    #[error("polling failed: {0}")]
    Poll(String),
    #[error("worker exited before the program was attached")]
    WorkerLost,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type EventCallback = Box<dyn FnMut(i32, &[u8])>;
pub type DropCallback = Box<dyn FnMut(i32, u64)>;

pub trait TraceBackend: Send + Sync {
    fn compile(&self, program: &CompiledProgram) -> Result<Box<dyn ProgramImage>, AttachError>;
}

/// A compiled but not yet loaded program.
pub trait ProgramImage {
    /// Arrange for `entry` to run whenever `provider:probe` fires.
    fn enable(&mut self, provider: &str, probe: &str, entry: &str) -> Result<(), AttachError>;

    /// Load into the kernel and attach every enabled probe in the process `pid`.
    fn load(self: Box<Self>, pid: u32) -> Result<Box<dyn LoadedProgram>, AttachError>;
}

pub trait LoadedProgram {
    fn open_event_stream(
        &mut self,
        channel: &str,
        on_event: EventCallback,
        on_drop: DropCallback,
    ) -> Result<(), AttachError>;

    fn chunk_source(&self, store: &str) -> Result<Box<dyn ChunkSource>, AttachError>;

    /// Deliver pending events, waiting at most `timeout`.
    fn poll(&mut self, timeout: Duration) -> Result<(), AttachError>;

    /// Detach and release everything.
    fn cleanup(self: Box<Self>);
}
