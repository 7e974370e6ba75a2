//! Text and JSON rendering of a finished session.

use std::fmt::{self, Write};

use anyhow::Result;

use crate::bundle::{Bundle, BundleNode};
use crate::hit::{ArgValue, ProbeHit};
use crate::session::Report;
use crate::stats::{human_secs, Summary, TimerSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub fn render(report: &Report, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(report)?),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
    }
}

fn format_value(value: &ArgValue) -> String {
    match value {
        ArgValue::Int(v) => v.to_string(),
        ArgValue::UInt(v) => v.to_string(),
        ArgValue::Pointer(v) => format!("{v:#x}"),
        ArgValue::Str(s) => format!("{s:?}"),
        ArgValue::Bytes(b) => format!("<{} bytes>", b.len()),
        ArgValue::Document(doc) => doc.to_string(),
        ArgValue::Malformed(b) => format!("<malformed, {} bytes>", b.len()),
        ArgValue::Struct(fields) => {
            let inner: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{k}={}", format_value(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        ArgValue::Transfer(err) => format!("<{}>", err.kind()),
    }
}

fn format_hit(hit: &ProbeHit) -> String {
    let args: Vec<String> = hit
        .args
        .iter()
        .map(|(k, v)| format!("{k}={}", format_value(v)))
        .collect();
    if args.is_empty() {
        hit.to_string()
    } else {
        format!("{} | {}", hit, args.join(" "))
    }
}

fn write_bundle(out: &mut String, bundle: &Bundle, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    write!(out, "{pad}[{:?}]", bundle.status)?;
    if let Some(name) = &bundle.name {
        write!(out, " {name}")?;
    }
    if let Some(counter) = bundle.counter {
        write!(out, " #{counter}")?;
    }
    if let Some(ns) = bundle.duration_ns() {
        write!(out, " {}", human_secs(ns as f64 / 1e9))?;
    }
    writeln!(out)?;

    if let Some(start) = &bundle.start {
        writeln!(out, "{pad}  + {}", format_hit(start))?;
    }
    for child in &bundle.children {
        match child {
            BundleNode::Hit(hit) => writeln!(out, "{pad}  - {}", format_hit(hit))?,
            BundleNode::Bundle(nested) => write_bundle(out, nested, indent + 1)?,
        }
    }
    if let Some(end) = &bundle.end {
        writeln!(out, "{pad}  + {}", format_hit(end))?;
    }
    Ok(())
}

fn write_timers(
    out: &mut String,
    title: &str,
    timers: &std::collections::BTreeMap<String, TimerSummary>,
) -> fmt::Result {
    if timers.is_empty() {
        return Ok(());
    }
    writeln!(out, "{title}:")?;
    for (name, t) in timers {
        writeln!(
            out,
            " - {name}: {} intervals, average {} ({:.2}/s)",
            t.count,
            human_secs(t.average_interval_secs),
            t.average_frequency_hz
        )?;
    }
    Ok(())
}

fn write_summary(out: &mut String, summary: &Summary) -> fmt::Result {
    writeln!(out, "=== summary ===")?;
    writeln!(out, "hits: {}", summary.hits)?;
    writeln!(out, "decode failures: {}", summary.decode_failures)?;
    writeln!(
        out,
        "dropped: {} ({:.2}%)",
        summary.dropped_total, summary.drop_percent
    )?;
    for (probe, count) in &summary.dropped {
        writeln!(out, " - {probe}: {count}")?;
    }
    if !summary.probes.is_empty() {
        write!(out, "probes: {}", summary.probes)?;
    }
    if !summary.comms.is_empty() {
        write!(out, "commands: {}", summary.comms)?;
    }
    if !summary.sizes.is_empty() {
        write!(out, "record sizes: {}", summary.sizes)?;
    }
    if !summary.errors.is_empty() {
        write!(out, "payload outcomes: {}", summary.errors)?;
    }
    write_timers(out, "intervals", &summary.intervals)?;
    write_timers(out, "start/stop", &summary.start_stop)
}

pub fn render_text(report: &Report) -> Result<String, fmt::Error> {
    let mut out = String::new();
    for thread in &report.threads {
        writeln!(
            out,
            "=== thread {} ({} hits, {} reordered, {} evicted) ===",
            thread.tid, thread.hits, thread.reordered, thread.evicted
        )?;
        for bundle in &thread.bundles {
            write_bundle(&mut out, bundle, 0)?;
        }
        writeln!(out)?;
    }

    if !report.operations.is_empty() {
        writeln!(out, "=== operations ===")?;
        for op in &report.operations {
            let probes: Vec<&str> = op.hits.iter().map(|h| h.probe.as_str()).collect();
            write!(out, "op {:#x}: {} hits ({})", op.op, op.hits.len(), probes.join(", "))?;
            if let (Some(first), Some(last)) = (op.first_ns(), op.last_ns()) {
                write!(out, " {}", human_secs((last - first) as f64 / 1e9))?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
    }

    write_summary(&mut out, &report.summary)?;
    Ok(out)
}
