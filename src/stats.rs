//! Aggregate statistics over a session.
//!
//! Counters are updated live as hits are decoded. Interval and start/stop timers need hits in
//! chronological order, so they are computed from the ordered thread histories when the session
//! ends.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::bundle::{END_SUFFIX, START_SUFFIX};
use crate::decode::DecodeError;
use crate::hit::{ArgValue, ProbeHit};
use crate::pipeline::DropCounter;

pub const SUCCESS: &str = "success";
pub const BAD_PAYLOAD: &str = "BAD_PAYLOAD";
pub const DECODE_FAILED: &str = "DECODE_FAILED";

/// Frequency table of values.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Counter {
    counts: BTreeMap<String, u64>,
    total: u64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encounter<T: fmt::Display>(&mut self, value: T) {
        *self.counts.entry(value.to_string()).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn count(&self, value: &str) -> u64 {
        self.counts.get(value).copied().unwrap_or(0)
    }

    pub fn probability(&self, value: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(value) as f64 / self.total as f64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Values with their counts, most frequent first.
    pub fn ranked(&self) -> Vec<(&str, u64)> {
        let mut ranked: Vec<(&str, u64)> =
            self.counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[total {}]", self.total)?;
        for (value, _) in self.ranked() {
            writeln!(f, " - {}: {:.2}%", value, self.probability(value) * 100.0)?;
        }
        Ok(())
    }
}

/// Format a duration in seconds with a readable unit.
pub fn human_secs(secs: f64) -> String {
    if secs == 0.0 {
        "0s".to_string()
    } else if secs < 1e-6 {
        format!("{:.2}ns", secs * 1e9)
    } else if secs < 1e-3 {
        format!("{:.2}us", secs * 1e6)
    } else if secs < 1.0 {
        format!("{:.2}ms", secs * 1e3)
    } else {
        format!("{:.2}s", secs)
    }
}

/// Running average of the time between consecutive events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalTimer {
    count: u64,
    total_secs: f64,
}

impl IntervalTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self, prev_ns: u64, ns: u64) {
        self.count += 1;
        self.total_secs += ns.saturating_sub(prev_ns) as f64 / 1e9;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total_secs(&self) -> f64 {
        self.total_secs
    }

    pub fn average_interval(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_secs / self.count as f64
    }

    pub fn average_frequency(&self) -> f64 {
        if self.total_secs == 0.0 {
            return 0.0;
        }
        self.count as f64 / self.total_secs
    }

    pub fn combine<'a, I>(timers: I) -> IntervalTimer
    where
        I: IntoIterator<Item = &'a IntervalTimer>,
    {
        timers
            .into_iter()
            .fold(IntervalTimer::default(), |acc, t| IntervalTimer {
                count: acc.count + t.count,
                total_secs: acc.total_secs + t.total_secs,
            })
    }
}

impl fmt::Display for IntervalTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} intervals, average {} ({:.2}/s)",
            self.count,
            human_secs(self.average_interval()),
            self.average_frequency()
        )
    }
}

/// Time between `<root>_start` and the next `<root>_end` on one thread.
#[derive(Debug, Clone)]
pub struct StartStopTimer {
    start: String,
    end: String,
    open: Vec<u64>,
    timer: IntervalTimer,
}

impl StartStopTimer {
    pub fn new(root: &str) -> Self {
        StartStopTimer {
            start: format!("{root}{START_SUFFIX}"),
            end: format!("{root}{END_SUFFIX}"),
            open: Vec::new(),
            timer: IntervalTimer::default(),
        }
    }

    pub fn tick(&mut self, hit: &ProbeHit) {
        if hit.probe == self.start {
            self.open.push(hit.ns);
        } else if hit.probe == self.end {
            if let Some(start) = self.open.pop() {
                self.timer.tick(start, hit.ns);
            }
        }
    }

    pub fn timer(&self) -> &IntervalTimer {
        &self.timer
    }

    /// Starts still waiting for their end.
    pub fn pending(&self) -> usize {
        self.open.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerSummary {
    pub count: u64,
    pub total_secs: f64,
    pub average_interval_secs: f64,
    pub average_frequency_hz: f64,
}

impl From<&IntervalTimer> for TimerSummary {
    fn from(t: &IntervalTimer) -> Self {
        TimerSummary {
            count: t.count(),
            total_secs: t.total_secs(),
            average_interval_secs: t.average_interval(),
            average_frequency_hz: t.average_frequency(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub hits: u64,
    pub decode_failures: u64,
    pub dropped_total: u64,
    pub dropped: BTreeMap<String, u64>,
    /// Dropped events as a share of everything the probes emitted.
    pub drop_percent: f64,
    pub probes: Counter,
    pub sizes: Counter,
    pub comms: Counter,
    pub errors: Counter,
    pub intervals: BTreeMap<String, TimerSummary>,
    pub start_stop: BTreeMap<String, TimerSummary>,
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    hits: u64,
    decode_failures: u64,
    probes: Counter,
    sizes: Counter,
    comms: Counter,
    errors: Counter,
    // probe -> tid -> timer
    intervals: BTreeMap<String, HashMap<u32, IntervalTimer>>,
    // delimiter root -> tid -> timer
    start_stop: BTreeMap<String, HashMap<u32, StartStopTimer>>,
}

fn count_outcomes(values: &BTreeMap<String, ArgValue>, errors: &mut Counter) {
    for value in values.values() {
        match value {
            ArgValue::Transfer(err) => errors.encounter(err.kind()),
            ArgValue::Malformed(_) => errors.encounter(BAD_PAYLOAD),
            ArgValue::Document(_) | ArgValue::Bytes(_) => errors.encounter(SUCCESS),
            ArgValue::Struct(fields) => count_outcomes(fields, errors),
            _ => {}
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, hit: &ProbeHit) {
        self.hits += 1;
        self.probes.encounter(&hit.probe);
        self.sizes.encounter(hit.size);
        self.comms.encounter(&hit.comm);
        count_outcomes(&hit.args, &mut self.errors);
    }

    pub fn record_decode_failure(&mut self, _probe: &str, _err: &DecodeError) {
        self.decode_failures += 1;
        self.errors.encounter(DECODE_FAILED);
    }

    /// Feed one thread's ordered hits into the interval and start/stop timers.
    pub fn absorb_history<'a, I>(&mut self, tid: u32, hits: I)
    where
        I: IntoIterator<Item = &'a Arc<ProbeHit>>,
    {
        let mut last: HashMap<&str, u64> = HashMap::new();
        for hit in hits {
            if let Some(prev) = last.insert(hit.probe.as_str(), hit.ns) {
                self.intervals
                    .entry(hit.probe.clone())
                    .or_default()
                    .entry(tid)
                    .or_default()
                    .tick(prev, hit.ns);
            }

            if let Some(root) = hit.probe.strip_suffix(START_SUFFIX) {
                self.start_stop
                    .entry(root.to_string())
                    .or_default()
                    .entry(tid)
                    .or_insert_with(|| StartStopTimer::new(root))
                    .tick(hit);
            } else if let Some(root) = hit.probe.strip_suffix(END_SUFFIX) {
                if let Some(timer) = self
                    .start_stop
                    .get_mut(root)
                    .and_then(|timers| timers.get_mut(&tid))
                {
                    timer.tick(hit);
                }
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn errors(&self) -> &Counter {
        &self.errors
    }

    pub fn probes(&self) -> &Counter {
        &self.probes
    }

    /// Interval timer of `probe` combined over all threads.
    pub fn interval(&self, probe: &str) -> Option<IntervalTimer> {
        self.intervals
            .get(probe)
            .map(|timers| IntervalTimer::combine(timers.values()))
    }

    /// Start/stop timer of the delimiter pair `root` combined over all threads.
    pub fn start_stop(&self, root: &str) -> Option<IntervalTimer> {
        self.start_stop
            .get(root)
            .map(|timers| IntervalTimer::combine(timers.values().map(StartStopTimer::timer)))
    }

    pub fn summary(&self, drops: &DropCounter) -> Summary {
        let dropped_total = drops.total();
        let emitted = self.hits + self.decode_failures + dropped_total;
        let drop_percent = if emitted == 0 {
            0.0
        } else {
            dropped_total as f64 * 100.0 / emitted as f64
        };
        Summary {
            hits: self.hits,
            decode_failures: self.decode_failures,
            dropped_total,
            dropped: drops.snapshot(),
            drop_percent,
            probes: self.probes.clone(),
            sizes: self.sizes.clone(),
            comms: self.comms.clone(),
            errors: self.errors.clone(),
            intervals: self
                .intervals
                .keys()
                .filter_map(|p| self.interval(p).map(|t| (p.clone(), TimerSummary::from(&t))))
                .collect(),
            start_stop: self
                .start_stop
                .keys()
                .filter_map(|r| {
                    self.start_stop(r)
                        .map(|t| (r.clone(), TimerSummary::from(&t)))
                })
                .collect(),
        }
    }
}
