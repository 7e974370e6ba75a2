//! Instrumentation program synthesis.
//!
//! Turns a group of [`ProbeSpec`]s into the C source of one libbpf program. Every probe gets an
//! entry function in `SEC("usdt")`, a packed output record held in a per-CPU scratch slot and
//! its own perf event channel. Generation is deterministic and needs nothing from the target
//! process, so it can be tested and dumped without loading anything.

pub mod chunked;
pub mod layout;

use std::fmt::{self, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::chunks::{ERR_BAD_CHUNK_IDX, ERR_BAD_PROBE_READ, ERR_LENGTH};
use crate::spec::{ArgKind, ArgSpec, ProbeSpec};

pub use layout::{EventHeader, FieldKind, FieldLayout, OutputLayout, HEADER_SIZE};

/// Per program instruction budget used when planning, the classic BPF_MAXINSNS.
pub const DEFAULT_PROGRAM_BUDGET: usize = 4096;

const BASE_COST: usize = 48;
const SCALAR_COST: usize = 8;
const STR_COST: usize = 16;
const STRUCT_COST: usize = 12;
const LONG_STR_COST: usize = 40;
const CHUNK_STEP_COST: usize = 16;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("failed to format program source")]
    Format(#[from] fmt::Error),
}

/// Admission decision of the sampling gate emitted into sampled probes.
///
/// A probe fires through when a uniform 32 bit draw is `<= threshold`, with
/// `threshold = floor(fraction * 2^32)` clamped to `u32::MAX`. Probes that are not sampled have
/// no gate at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleGate {
    threshold: Option<u32>,
}

impl SampleGate {
    pub fn new(fraction: f64) -> Self {
        if fraction >= 1.0 {
            return SampleGate { threshold: None };
        }
        let scaled = (fraction * 4294967296.0).floor();
        let threshold = if scaled >= u32::MAX as f64 {
            u32::MAX
        } else if scaled <= 0.0 {
            0
        } else {
            scaled as u32
        };
        SampleGate {
            threshold: Some(threshold),
        }
    }

    pub fn threshold(&self) -> Option<u32> {
        self.threshold
    }

    pub fn admits(&self, draw: u32) -> bool {
        match self.threshold {
            Some(threshold) => draw <= threshold,
            None => true,
        }
    }
}

/// Rough instruction count of a probe's entry function.
pub fn estimate_cost(spec: &ProbeSpec) -> usize {
    fn arg_cost(arg: &ArgSpec) -> usize {
        match arg.kind() {
            ArgKind::Str { .. } => STR_COST,
            ArgKind::Struct { fields } => {
                STRUCT_COST + fields.iter().map(arg_cost).sum::<usize>()
            }
            _ => SCALAR_COST,
        }
    }

    let mut cost = BASE_COST + spec.args().iter().map(arg_cost).sum::<usize>();
    if spec.long_str().is_some() {
        cost += LONG_STR_COST + CHUNK_STEP_COST * spec.chunk_count() as usize;
    }
    cost
}

/// Pack probes, in order, into groups whose estimated cost fits `budget`. A probe that is over
/// budget on its own still gets a group of its own.
pub fn plan_programs(specs: &[Arc<ProbeSpec>], budget: usize) -> Vec<Vec<Arc<ProbeSpec>>> {
    let mut groups = Vec::new();
    let mut current: Vec<Arc<ProbeSpec>> = Vec::new();
    let mut current_cost = 0;

    for spec in specs {
        let cost = estimate_cost(spec);
        if !current.is_empty() && current_cost + cost > budget {
            groups.push(std::mem::take(&mut current));
            current_cost = 0;
        }
        current_cost += cost;
        current.push(spec.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Everything the pipeline needs to know about one probe inside a compiled program.
#[derive(Debug, Clone)]
pub struct ProbeProgram {
    spec: Arc<ProbeSpec>,
    entry: String,
    channel: String,
    chunk_store: Option<String>,
    layout: OutputLayout,
}

impl ProbeProgram {
    fn new(spec: Arc<ProbeSpec>) -> Self {
        let name = spec.name().to_string();
        let chunk_store = spec.long_str().map(|_| chunked::store_name(&name));
        let layout = OutputLayout::for_probe(&spec);
        ProbeProgram {
            entry: format!("{name}_entry"),
            channel: format!("{name}_events"),
            chunk_store,
            layout,
            spec,
        }
    }

    pub fn spec(&self) -> &Arc<ProbeSpec> {
        &self.spec
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// Name of the entry function attached to the probe.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Name of the perf event array the probe emits on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn chunk_store(&self) -> Option<&str> {
        self.chunk_store.as_deref()
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }
}

#[derive(Debug, Clone)]
pub struct CompiledProgram {
    source: String,
    probes: Vec<ProbeProgram>,
}

impl CompiledProgram {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn probes(&self) -> &[ProbeProgram] {
        &self.probes
    }

    pub fn probe(&self, name: &str) -> Option<&ProbeProgram> {
        self.probes.iter().find(|p| p.name() == name)
    }
}

fn mirror_name(probe: &str, arg: &ArgSpec) -> String {
    let name = arg.name();
    let suffix = arg.field_name().strip_prefix(name.as_str()).unwrap_or("");
    format!("{probe}_level_{}_{}{}", arg.depth(), arg.index(), suffix)
}

fn emit_prologue(out: &mut String) -> fmt::Result {
    writeln!(out, "// Generated by usdtrace. Do not edit.")?;
    writeln!(out, "#include <linux/types.h>")?;
    writeln!(out, "#include <linux/bpf.h>")?;
    writeln!(out, "#include <linux/ptrace.h>")?;
    writeln!(out, "#include <bpf/bpf_helpers.h>")?;
    writeln!(out, "#include <bpf/bpf_tracing.h>")?;
    writeln!(out, "#include <bpf/usdt.bpf.h>")?;
    writeln!(out)?;
    writeln!(out, "#define USDTRACE_ERR_BAD_CHUNK_IDX ({ERR_BAD_CHUNK_IDX})")?;
    writeln!(out, "#define USDTRACE_ERR_BAD_PROBE_READ ({ERR_BAD_PROBE_READ})")?;
    writeln!(out, "#define USDTRACE_ERR_LENGTH ({ERR_LENGTH})")?;
    writeln!(out)?;
    writeln!(out, "char LICENSE[] SEC(\"license\") = \"GPL\";")?;
    writeln!(out)
}

fn emit_mirror(out: &mut String, probe: &str, arg: &ArgSpec) -> fmt::Result {
    // Children first so every member type is complete before use.
    for field in arg.fields() {
        if let ArgKind::Struct { .. } = field.kind() {
            emit_mirror(out, probe, field)?;
        }
    }
    writeln!(out, "struct {} {{", mirror_name(probe, arg))?;
    for field in arg.fields() {
        let name = field.name();
        match field.kind() {
            ArgKind::Struct { .. } => {
                writeln!(out, "\tstruct {} {name};", mirror_name(probe, field))?
            }
            ArgKind::Str { len } => writeln!(out, "\tchar {name}[{len}];")?,
            kind => writeln!(out, "\t{} {name};", layout::mirror_c_type(kind))?,
        }
    }
    writeln!(out, "}};")?;
    writeln!(out)
}

fn emit_struct_copy(out: &mut String, arg: &ArgSpec, src: &str) -> fmt::Result {
    for field in arg.fields() {
        let member = format!("{src}.{}", field.name());
        let dst = field.field_name();
        match field.kind() {
            ArgKind::Struct { .. } => emit_struct_copy(out, field, &member)?,
            ArgKind::Str { .. } => writeln!(
                out,
                "\tbpf_probe_read_kernel_str(out->{dst}, sizeof(out->{dst}), {member});"
            )?,
            _ => writeln!(out, "\tout->{dst} = {member};")?,
        }
    }
    Ok(())
}

fn emit_arg(out: &mut String, program: &ProbeProgram, index: usize, arg: &ArgSpec) -> fmt::Result {
    let probe = program.name();
    let field = arg.field_name();
    writeln!(out, "\tbpf_usdt_arg(ctx, {index}, &arg);")?;
    match arg.kind() {
        ArgKind::Int => writeln!(out, "\tout->{field} = (__s32)arg;"),
        ArgKind::Long => writeln!(out, "\tout->{field} = (__s64)arg;"),
        ArgKind::ULong | ArgKind::Pointer => writeln!(out, "\tout->{field} = (__u64)arg;"),
        ArgKind::Char => writeln!(out, "\tout->{field} = (__s8)arg;"),
        ArgKind::Str { .. } => writeln!(
            out,
            "\tbpf_probe_read_user_str(out->{field}, sizeof(out->{field}), (const void *)arg);"
        ),
        ArgKind::Struct { .. } => {
            writeln!(
                out,
                "\tbpf_probe_read_user(&structs->{field}, sizeof(structs->{field}), (const void *)arg);"
            )?;
            emit_struct_copy(out, arg, &format!("structs->{field}"))
        }
        ArgKind::LongStr { len_arg } => {
            let routine = chunked::routine_name(probe);
            writeln!(out, "\tsrc = (const char *)arg;")?;
            match len_arg {
                Some(len_index) => {
                    writeln!(out, "\tbpf_usdt_arg(ctx, {len_index}, &arg);")?;
                    writeln!(out, "\tlen = (__s32)arg;")?;
                    writeln!(out, "\tout->{field}_sz = {routine}(src, len, &start);")?;
                }
                None => {
                    writeln!(out, "\tif (bpf_probe_read_user(&len, sizeof(len), src))")?;
                    writeln!(out, "\t\tout->{field}_sz = USDTRACE_ERR_BAD_PROBE_READ;")?;
                    writeln!(out, "\telse")?;
                    writeln!(out, "\t\tout->{field}_sz = {routine}(src, len, &start);")?;
                }
            }
            writeln!(out, "\tout->{field}_idx = start;")
        }
    }
}

fn emit_probe(out: &mut String, program: &ProbeProgram) -> fmt::Result {
    let spec = program.spec().clone();
    let probe = spec.name();
    let gate = SampleGate::new(spec.sampling());
    let structs: Vec<&ArgSpec> = spec
        .args()
        .iter()
        .filter(|a| matches!(a.kind(), ArgKind::Struct { .. }))
        .collect();

    writeln!(out, "/* {probe} */")?;
    writeln!(out)?;
    if let Some(threshold) = gate.threshold() {
        writeln!(
            out,
            "#define {}_SAMPLE_THRESH {threshold}U",
            probe.to_uppercase()
        )?;
        writeln!(out)?;
    }

    for arg in &structs {
        emit_mirror(out, probe, arg)?;
    }
    if !structs.is_empty() {
        writeln!(out, "struct {probe}_structs {{")?;
        for arg in &structs {
            writeln!(out, "\tstruct {} {};", mirror_name(probe, arg), arg.field_name())?;
        }
        writeln!(out, "}};")?;
        writeln!(out)?;
        emit_scratch(out, &format!("{probe}_struct_scratch"), &format!("{probe}_structs"))?;
    }

    writeln!(out, "struct {probe}_output {{")?;
    writeln!(out, "\tchar comm[{}];", layout::COMM_LEN)?;
    writeln!(out, "\t__u32 pid;")?;
    writeln!(out, "\t__u32 tid;")?;
    writeln!(out, "\t__u64 ns;")?;
    for field in program.layout().fields() {
        writeln!(out, "\t{};", field.kind.c_decl(&field.name))?;
    }
    writeln!(out, "}} __attribute__((packed));")?;
    writeln!(out)?;
    emit_scratch(out, &format!("{probe}_scratch"), &format!("{probe}_output"))?;

    writeln!(out, "struct {{")?;
    writeln!(out, "\t__uint(type, BPF_MAP_TYPE_PERF_EVENT_ARRAY);")?;
    writeln!(out, "\t__uint(key_size, sizeof(__u32));")?;
    writeln!(out, "\t__uint(value_size, sizeof(__u32));")?;
    writeln!(out, "}} {} SEC(\".maps\");", program.channel())?;
    writeln!(out)?;

    if spec.long_str().is_some() {
        chunked::emit_chunk_store(out, probe, spec.chunk_size(), spec.chunk_count())?;
        chunked::emit_copy_routine(out, probe, spec.chunk_count())?;
    }

    writeln!(out, "SEC(\"usdt\")")?;
    writeln!(out, "int {}(struct pt_regs *ctx)", program.entry())?;
    writeln!(out, "{{")?;
    writeln!(out, "\tstruct {probe}_output *out;")?;
    if !structs.is_empty() {
        writeln!(out, "\tstruct {probe}_structs *structs;")?;
    }
    if spec.long_str().is_some() {
        writeln!(out, "\tconst char *src;")?;
        writeln!(out, "\t__s32 len = 0;")?;
        writeln!(out, "\t__u32 start = 0;")?;
    }
    writeln!(out, "\t__u64 tgid_pid;")?;
    writeln!(out, "\t__u32 zero = 0;")?;
    writeln!(out, "\tlong arg = 0;")?;
    writeln!(out)?;
    if gate.threshold().is_some() {
        writeln!(
            out,
            "\tif (bpf_get_prandom_u32() > {}_SAMPLE_THRESH)",
            probe.to_uppercase()
        )?;
        writeln!(out, "\t\treturn 0;")?;
        writeln!(out)?;
    }
    writeln!(out, "\tout = bpf_map_lookup_elem(&{probe}_scratch, &zero);")?;
    writeln!(out, "\tif (!out)")?;
    writeln!(out, "\t\treturn 0;")?;
    if !structs.is_empty() {
        writeln!(
            out,
            "\tstructs = bpf_map_lookup_elem(&{probe}_struct_scratch, &zero);"
        )?;
        writeln!(out, "\tif (!structs)")?;
        writeln!(out, "\t\treturn 0;")?;
    }
    writeln!(out)?;
    writeln!(out, "\tout->ns = bpf_ktime_get_ns();")?;
    writeln!(out, "\ttgid_pid = bpf_get_current_pid_tgid();")?;
    writeln!(out, "\tout->pid = tgid_pid >> 32;")?;
    writeln!(out, "\tout->tid = (__u32)tgid_pid;")?;
    writeln!(out, "\tbpf_get_current_comm(&out->comm, sizeof(out->comm));")?;
    for (index, arg) in spec.args().iter().enumerate() {
        writeln!(out)?;
        emit_arg(out, program, index, arg)?;
    }
    writeln!(out)?;
    writeln!(
        out,
        "\tbpf_perf_event_output(ctx, &{}, BPF_F_CURRENT_CPU, out, sizeof(*out));",
        program.channel()
    )?;
    writeln!(out, "\treturn 0;")?;
    writeln!(out, "}}")?;
    writeln!(out)
}

fn emit_scratch(out: &mut String, map: &str, value: &str) -> fmt::Result {
    writeln!(out, "struct {{")?;
    writeln!(out, "\t__uint(type, BPF_MAP_TYPE_PERCPU_ARRAY);")?;
    writeln!(out, "\t__uint(max_entries, 1);")?;
    writeln!(out, "\t__type(key, __u32);")?;
    writeln!(out, "\t__type(value, struct {value});")?;
    writeln!(out, "}} {map} SEC(\".maps\");")?;
    writeln!(out)
}

/// Generate one program covering every probe in `specs`.
pub fn generate(specs: &[Arc<ProbeSpec>]) -> Result<CompiledProgram, CodegenError> {
    let probes: Vec<ProbeProgram> = specs.iter().cloned().map(ProbeProgram::new).collect();
    let mut source = String::new();
    emit_prologue(&mut source)?;
    for probe in &probes {
        emit_probe(&mut source, probe)?;
    }
    Ok(CompiledProgram { source, probes })
}
