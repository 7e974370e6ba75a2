//! Compiles generated programs with clang and runs them through libbpf-rs.

use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use libbpf_rs::{
    Link, MapCore, MapFlags, MapHandle, Object, ObjectBuilder, OpenObject, PerfBuffer,
    PerfBufferBuilder,
};
use log::{debug, info};
use tempfile::TempDir;

use crate::backend::{
    AttachError, DropCallback, EventCallback, LoadedProgram, ProgramImage, TraceBackend,
};
use crate::chunks::ChunkSource;
use crate::codegen::CompiledProgram;

/// Default perf buffer size per CPU, in pages.
pub const DEFAULT_PERF_PAGES: usize = 64;

#[derive(Debug, Clone)]
pub struct LibbpfBackend {
    /// clang binary used to build programs.
    pub clang: PathBuf,
    /// Extra include directories passed to clang.
    pub include_dirs: Vec<PathBuf>,
    /// Perf buffer size per CPU, in pages.
    pub perf_pages: usize,
}

impl Default for LibbpfBackend {
    fn default() -> Self {
        LibbpfBackend {
            clang: PathBuf::from("clang"),
            include_dirs: Vec::new(),
            perf_pages: DEFAULT_PERF_PAGES,
        }
    }
}

fn target_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x86",
        "aarch64" => "arm64",
        "riscv64" => "riscv",
        "powerpc64" => "powerpc",
        "s390x" => "s390",
        other => other,
    }
}

/// Sort a libbpf load failure into the kinds the pipeline reacts to.
fn classify_load_error(err: libbpf_rs::Error) -> AttachError {
    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();
    if lower.contains("e2big")
        || lower.contains("argument list too long")
        || lower.contains("too large")
        || lower.contains("too many instructions")
    {
        AttachError::LimitExceeded(msg)
    } else if lower.contains("permission denied") || lower.contains("invalid argument") {
        AttachError::VerifierRejected(msg)
    } else {
        AttachError::Load(msg)
    }
}

impl TraceBackend for LibbpfBackend {
    fn compile(&self, program: &CompiledProgram) -> Result<Box<dyn ProgramImage>, AttachError> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("usdtrace.bpf.c");
        let obj = dir.path().join("usdtrace.bpf.o");
        fs::write(&src, program.source())?;

        let mut cmd = Command::new(&self.clang);
        cmd.args(["-g", "-O2", "-target", "bpf"])
            .arg(format!("-D__TARGET_ARCH_{}", target_arch()))
            .arg(format!("-I/usr/include/{}-linux-gnu", std::env::consts::ARCH));
        for dir in &self.include_dirs {
            cmd.arg("-I").arg(dir);
        }
        cmd.arg("-c").arg(&src).arg("-o").arg(&obj);

        debug!("Compiling {} probes: {:?}", program.probes().len(), cmd);
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(AttachError::Compile(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let open = ObjectBuilder::default()
            .open_file(&obj)
            .map_err(|e| AttachError::Compile(format!("{e:#}")))?;
        Ok(Box::new(LibbpfImage {
            open,
            targets: Vec::new(),
            perf_pages: self.perf_pages,
            _dir: dir,
        }))
    }
}

struct UsdtTarget {
    provider: String,
    probe: String,
    entry: String,
}

struct LibbpfImage {
    open: OpenObject,
    targets: Vec<UsdtTarget>,
    perf_pages: usize,
    _dir: TempDir,
}

impl ProgramImage for LibbpfImage {
    fn enable(&mut self, provider: &str, probe: &str, entry: &str) -> Result<(), AttachError> {
        let found = self
            .open
            .progs()
            .any(|prog| prog.name() == OsStr::new(entry));
        if !found {
            return Err(AttachError::Enable {
                provider: provider.to_string(),
                probe: probe.to_string(),
                reason: format!("program has no entry function {entry}"),
            });
        }
        self.targets.push(UsdtTarget {
            provider: provider.to_string(),
            probe: probe.to_string(),
            entry: entry.to_string(),
        });
        Ok(())
    }

    fn load(self: Box<Self>, pid: u32) -> Result<Box<dyn LoadedProgram>, AttachError> {
        let LibbpfImage {
            open,
            targets,
            perf_pages,
            _dir,
        } = *self;

        let mut object = open.load().map_err(classify_load_error)?;
        let binary = PathBuf::from(format!("/proc/{pid}/exe"));

        let mut links = Vec::with_capacity(targets.len());
        for target in &targets {
            let enable_err = |reason: String| AttachError::Enable {
                provider: target.provider.clone(),
                probe: target.probe.clone(),
                reason,
            };
            let prog = object
                .progs_mut()
                .find(|prog| prog.name() == OsStr::new(&target.entry))
                .ok_or_else(|| enable_err(format!("no program {}", target.entry)))?;
            let link = prog
                .attach_usdt(pid as i32, &binary, &target.provider, &target.probe)
                .map_err(|e| enable_err(format!("{e:#}")))?;
            info!(
                "Attached {}:{} in pid {}",
                target.provider, target.probe, pid
            );
            links.push(link);
        }

        Ok(Box::new(LibbpfLoaded {
            buffers: Vec::new(),
            links,
            object,
            perf_pages,
            _dir,
        }))
    }
}

// Field order is drop order: buffers and links go before the object that owns their fds.
struct LibbpfLoaded {
    buffers: Vec<PerfBuffer<'static>>,
    links: Vec<Link>,
    object: Object,
    perf_pages: usize,
    _dir: TempDir,
}

struct MapChunks {
    map: MapHandle,
}

impl ChunkSource for MapChunks {
    fn read_chunk(&self, index: u32) -> Option<Vec<u8>> {
        match self.map.lookup(&index.to_ne_bytes(), MapFlags::ANY) {
            Ok(value) => value,
            Err(err) => {
                debug!("chunk {} lookup failed: {}", index, err);
                None
            }
        }
    }
}

impl LoadedProgram for LibbpfLoaded {
    fn open_event_stream(
        &mut self,
        channel: &str,
        on_event: EventCallback,
        on_drop: DropCallback,
    ) -> Result<(), AttachError> {
        let stream_err = |reason: String| AttachError::EventStream {
            channel: channel.to_string(),
            reason,
        };
        let buffer = {
            let map = self
                .object
                .maps()
                .find(|map| map.name() == OsStr::new(channel))
                .ok_or_else(|| stream_err("no such map".to_string()))?;
            PerfBufferBuilder::new(&map)
                .pages(self.perf_pages)
                .sample_cb(on_event)
                .lost_cb(on_drop)
                .build()
                .map_err(|e| stream_err(format!("{e:#}")))?
        };
        self.buffers.push(buffer);
        Ok(())
    }

    fn chunk_source(&self, store: &str) -> Result<Box<dyn ChunkSource>, AttachError> {
        let map = self
            .object
            .maps()
            .find(|map| map.name() == OsStr::new(store))
            .ok_or_else(|| AttachError::ChunkStore(store.to_string()))?;
        let map = MapHandle::try_from(&map)
            .map_err(|e| AttachError::ChunkStore(format!("{store}: {e:#}")))?;
        Ok(Box::new(MapChunks { map }))
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), AttachError> {
        if self.buffers.is_empty() {
            std::thread::sleep(timeout);
            return Ok(());
        }
        let slice = timeout / self.buffers.len() as u32;
        for buffer in &self.buffers {
            if let Err(err) = buffer.poll(slice) {
                if err.kind() != libbpf_rs::ErrorKind::Interrupted {
                    return Err(AttachError::Poll(format!("{err:#}")));
                }
            }
        }
        Ok(())
    }

    fn cleanup(self: Box<Self>) {
        let LibbpfLoaded {
            buffers,
            links,
            object,
            ..
        } = *self;
        drop(buffers);
        drop(links);
        drop(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_arch() {
        assert!(!target_arch().is_empty());
    }

    #[test]
    fn test_compile_failure_is_reported() {
        let backend = LibbpfBackend {
            clang: PathBuf::from("/nonexistent/clang"),
            ..Default::default()
        };
        let program = crate::codegen::generate(&[]).unwrap();
        assert!(matches!(backend.compile(&program), Err(AttachError::Io(_))));
    }
}
