//! Kernel side of the long-string protocol.
//!
//! Each probe with a long-string argument gets its own chunk ring: an array map of
//! `chunk_count` chunks of `chunk_size` bytes, a one-cell map holding the next free chunk, and
//! a copy routine unrolled into exactly `chunk_count` bounded steps. The routine reserves
//! `ceil(len / chunk_size)` chunks with an atomic fetch-add, takes the start modulo the ring
//! size and copies the payload chunk by chunk. It returns the byte count, or one of the
//! sentinels from [`crate::chunks`] on failure.
//!
//! The ring is best effort: a writer that laps a slow reader overwrites chunks the reader has
//! not consumed yet.

use std::fmt::{self, Write};

pub fn store_name(probe: &str) -> String {
    format!("{probe}_chunks")
}

pub fn next_cell_name(probe: &str) -> String {
    format!("{probe}_next_chunk")
}

pub fn routine_name(probe: &str) -> String {
    format!("{probe}_copy_long_str")
}

fn size_define(probe: &str) -> String {
    format!("{}_CHUNK_SIZE", probe.to_uppercase())
}

fn count_define(probe: &str) -> String {
    format!("{}_CHUNK_COUNT", probe.to_uppercase())
}

pub(crate) fn emit_chunk_store(
    out: &mut String,
    probe: &str,
    chunk_size: u32,
    chunk_count: u32,
) -> fmt::Result {
    let size = size_define(probe);
    let count = count_define(probe);
    writeln!(out, "#define {size} {chunk_size}")?;
    writeln!(out, "#define {count} {chunk_count}")?;
    writeln!(out)?;
    writeln!(out, "struct {probe}_chunk {{")?;
    writeln!(out, "\tchar data[{size}];")?;
    writeln!(out, "}};")?;
    writeln!(out)?;
    writeln!(out, "struct {{")?;
    writeln!(out, "\t__uint(type, BPF_MAP_TYPE_ARRAY);")?;
    writeln!(out, "\t__uint(max_entries, {count});")?;
    writeln!(out, "\t__type(key, __u32);")?;
    writeln!(out, "\t__type(value, struct {probe}_chunk);")?;
    writeln!(out, "}} {} SEC(\".maps\");", store_name(probe))?;
    writeln!(out)?;
    writeln!(out, "struct {{")?;
    writeln!(out, "\t__uint(type, BPF_MAP_TYPE_ARRAY);")?;
    writeln!(out, "\t__uint(max_entries, 1);")?;
    writeln!(out, "\t__type(key, __u32);")?;
    writeln!(out, "\t__type(value, __u32);")?;
    writeln!(out, "}} {} SEC(\".maps\");", next_cell_name(probe))?;
    writeln!(out)
}

pub(crate) fn emit_copy_routine(out: &mut String, probe: &str, chunk_count: u32) -> fmt::Result {
    let size = size_define(probe);
    let count = count_define(probe);
    let store = store_name(probe);

    writeln!(
        out,
        "static __always_inline __s32 {}(const char *src, __s32 len, __u32 *start)",
        routine_name(probe)
    )?;
    writeln!(out, "{{")?;
    writeln!(out, "\tstruct {probe}_chunk *chunk;")?;
    writeln!(out, "\t__u32 zero = 0, needed, first, idx, step;")?;
    writeln!(out, "\t__u32 *next;")?;
    writeln!(out, "\t__s32 remaining = len;")?;
    writeln!(out)?;
    writeln!(out, "\t*start = 0;")?;
    writeln!(out, "\tif (len < 0)")?;
    writeln!(out, "\t\treturn USDTRACE_ERR_LENGTH;")?;
    writeln!(out, "\tneeded = ((__u32)len + {size} - 1) / {size};")?;
    writeln!(out, "\tif (needed > {count})")?;
    writeln!(out, "\t\treturn USDTRACE_ERR_LENGTH;")?;
    writeln!(
        out,
        "\tnext = bpf_map_lookup_elem(&{}, &zero);",
        next_cell_name(probe)
    )?;
    writeln!(out, "\tif (!next)")?;
    writeln!(out, "\t\treturn USDTRACE_ERR_BAD_CHUNK_IDX;")?;
    writeln!(out, "\tfirst = __sync_fetch_and_add(next, needed) % {count};")?;
    writeln!(out, "\t*start = first;")?;

    for i in 0..chunk_count {
        writeln!(out)?;
        writeln!(out, "\tif (remaining <= 0)")?;
        writeln!(out, "\t\treturn len;")?;
        writeln!(out, "\tidx = (first + {i}) % {count};")?;
        writeln!(out, "\tif (idx >= {count})")?;
        writeln!(out, "\t\treturn USDTRACE_ERR_BAD_CHUNK_IDX;")?;
        writeln!(out, "\tchunk = bpf_map_lookup_elem(&{store}, &idx);")?;
        writeln!(out, "\tif (!chunk)")?;
        writeln!(out, "\t\treturn USDTRACE_ERR_BAD_CHUNK_IDX;")?;
        writeln!(
            out,
            "\tstep = remaining < {size} ? (__u32)remaining : {size};"
        )?;
        writeln!(out, "\tif (step > {size})")?;
        writeln!(out, "\t\treturn USDTRACE_ERR_LENGTH;")?;
        writeln!(
            out,
            "\tif (bpf_probe_read_user(chunk->data, step, src + (__u64){i} * {size}))"
        )?;
        writeln!(out, "\t\treturn USDTRACE_ERR_BAD_PROBE_READ;")?;
        writeln!(out, "\tremaining -= step;")?;
    }

    writeln!(out)?;
    writeln!(out, "\tif (remaining != 0)")?;
    writeln!(out, "\t\treturn USDTRACE_ERR_LENGTH;")?;
    writeln!(out, "\treturn len;")?;
    writeln!(out, "}}")?;
    writeln!(out)
}
