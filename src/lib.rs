//! usdtrace library - attach generated eBPF programs to USDT probes and rebuild request
//! lifecycles from the events they emit.
//!
//! # Modules
//!
//! - [`spec`] - Probe specifications and JSON probe tables
//! - [`codegen`] - Instrumentation program synthesis
//! - [`backend`] / [`libbpf_backend`] - Compile, load and attach programs
//! - [`pipeline`] - Worker threads, decoding and drop accounting
//! - [`store`] - Per-thread chronological hit histories
//! - [`bundle`] - Start/end span reconstruction
//! - [`stats`] - Counters and timers
//! - [`session`] - Ties everything together for the CLI
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usdtrace::codegen;
//! use usdtrace::spec::{ArgSpec, ProbeSpec};
//!
//! let probe = ProbeSpec::new(
//!     "findCmdRun",
//!     vec![ArgSpec::pointer("opCtx"), ArgSpec::long_string("bson")],
//! )
//! .expect("valid probe");
//! let program = codegen::generate(&[Arc::new(probe)]).expect("generated program");
//! println!("{}", program.source());
//! ```

pub mod arena;
pub mod backend;
pub mod bundle;
pub mod chunks;
pub mod codegen;
pub mod decode;
pub mod hit;
pub mod libbpf_backend;
pub mod pipeline;
pub mod render;
pub mod session;
pub mod spec;
pub mod stats;
pub mod store;

pub use hit::{ArgValue, ProbeHit};
pub use session::{bump_memlock_rlimit, run, Config};
