//! Reconstructing request lifecycles from one thread's ordered hits.
//!
//! A hit named `<x>_start` opens a span identified by its counter argument. The matching
//! `<x>_end` with the same counter closes it. Anything in between becomes a leaf of the innermost
//! open span, and spans nest without a depth limit. Hits that arrive while no span is open are
//! collected into `Loose` bundles so nothing is lost.

use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::hit::ProbeHit;

pub const START_SUFFIX: &str = "_start";
pub const END_SUFFIX: &str = "_end";
pub const DEFAULT_COUNTER_ARG: &str = "count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BundleStatus {
    /// Start and end both seen.
    Closed,
    /// Still open when the history ended.
    Open,
    /// Closed by the staleness timeout.
    Expired,
    /// Hits seen while no span was open.
    Loose,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BundleNode {
    Hit(Arc<ProbeHit>),
    Bundle(Bundle),
}

#[derive(Debug, Clone, Serialize)]
pub struct Bundle {
    /// Delimiter root, `requestX` for `requestX_start`. `None` for loose bundles.
    pub name: Option<String>,
    pub counter: Option<i64>,
    pub status: BundleStatus,
    pub start: Option<Arc<ProbeHit>>,
    pub end: Option<Arc<ProbeHit>>,
    pub children: Vec<BundleNode>,
}

impl Bundle {
    fn open(root: &str, counter: Option<i64>, start: Arc<ProbeHit>) -> Self {
        Bundle {
            name: Some(root.to_string()),
            counter,
            status: BundleStatus::Open,
            start: Some(start),
            end: None,
            children: Vec::new(),
        }
    }

    fn loose() -> Self {
        Bundle {
            name: None,
            counter: None,
            status: BundleStatus::Loose,
            start: None,
            end: None,
            children: Vec::new(),
        }
    }

    /// Nesting depth: 1 for a bundle without nested bundles.
    pub fn depth(&self) -> usize {
        1 + self
            .nested()
            .map(Bundle::depth)
            .max()
            .unwrap_or(0)
    }

    pub fn nested(&self) -> impl Iterator<Item = &Bundle> {
        self.children.iter().filter_map(|c| match c {
            BundleNode::Bundle(b) => Some(b),
            BundleNode::Hit(_) => None,
        })
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Arc<ProbeHit>> {
        self.children.iter().filter_map(|c| match c {
            BundleNode::Hit(h) => Some(h),
            BundleNode::Bundle(_) => None,
        })
    }

    /// Bundles in this tree, this one included, that never saw their end.
    pub fn open_count(&self) -> usize {
        let own = usize::from(self.status == BundleStatus::Open);
        own + self.nested().map(Bundle::open_count).sum::<usize>()
    }

    /// Every hit in the tree, delimiters included.
    pub fn hit_count(&self) -> usize {
        let delimiters = self.start.iter().count() + self.end.iter().count();
        delimiters
            + self
                .children
                .iter()
                .map(|c| match c {
                    BundleNode::Hit(_) => 1,
                    BundleNode::Bundle(b) => b.hit_count(),
                })
                .sum::<usize>()
    }

    pub fn duration_ns(&self) -> Option<u64> {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => Some(end.ns.saturating_sub(start.ns)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Argument identifying a span, matched between start and end.
    pub counter_arg: String,
    /// Expire spans older than this, relative to the hit being processed.
    pub stale_after_ns: Option<u64>,
}

impl Default for BundleOptions {
    fn default() -> Self {
        BundleOptions {
            counter_arg: DEFAULT_COUNTER_ARG.to_string(),
            stale_after_ns: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructorState {
    Idle,
    Building { depth: usize },
}

pub struct Reconstructor {
    options: BundleOptions,
    stack: Vec<Bundle>,
    forest: Vec<Bundle>,
}

impl Reconstructor {
    pub fn new(options: BundleOptions) -> Self {
        Reconstructor {
            options,
            stack: Vec::new(),
            forest: Vec::new(),
        }
    }

    pub fn state(&self) -> ReconstructorState {
        match self.stack.len() {
            0 => ReconstructorState::Idle,
            depth => ReconstructorState::Building { depth },
        }
    }

    fn attach(&mut self, bundle: Bundle) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(BundleNode::Bundle(bundle)),
            None => self.forest.push(bundle),
        }
    }

    fn expire_stale(&mut self, now: u64) {
        let Some(stale_after) = self.options.stale_after_ns else {
            return;
        };
        let stale = self.stack.iter().position(|b| {
            b.start
                .as_ref()
                .is_some_and(|s| now.saturating_sub(s.ns) > stale_after)
        });
        let Some(first) = stale else {
            return;
        };
        while self.stack.len() > first {
            if let Some(mut bundle) = self.stack.pop() {
                debug!("Expiring span {:?}", bundle.name);
                bundle.status = BundleStatus::Expired;
                self.attach(bundle);
            }
        }
    }

    fn closes_innermost(&self, root: &str, counter: Option<i64>) -> bool {
        self.stack
            .last()
            .is_some_and(|top| top.name.as_deref() == Some(root) && top.counter == counter)
    }

    pub fn push(&mut self, hit: Arc<ProbeHit>) {
        self.expire_stale(hit.ns);
        let counter = hit.arg_i64(&self.options.counter_arg);

        if let Some(root) = hit.probe.strip_suffix(START_SUFFIX) {
            let root = root.to_string();
            self.stack.push(Bundle::open(&root, counter, hit));
            return;
        }

        if let Some(root) = hit.probe.strip_suffix(END_SUFFIX) {
            if self.closes_innermost(root, counter) {
                if let Some(mut bundle) = self.stack.pop() {
                    bundle.end = Some(hit);
                    bundle.status = BundleStatus::Closed;
                    self.attach(bundle);
                }
                return;
            }
        }

        match self.stack.last_mut() {
            Some(top) => top.children.push(BundleNode::Hit(hit)),
            None => {
                let reuse = self
                    .forest
                    .last()
                    .is_some_and(|b| b.status == BundleStatus::Loose);
                if !reuse {
                    self.forest.push(Bundle::loose());
                }
                if let Some(loose) = self.forest.last_mut() {
                    loose.children.push(BundleNode::Hit(hit));
                }
            }
        }
    }

    /// Close out the history. Spans still open are reported as `Open`.
    pub fn finish(mut self) -> Vec<Bundle> {
        while let Some(bundle) = self.stack.pop() {
            self.attach(bundle);
        }
        self.forest
    }
}

pub fn reconstruct<I>(hits: I, options: &BundleOptions) -> Vec<Bundle>
where
    I: IntoIterator<Item = Arc<ProbeHit>>,
{
    let mut reconstructor = Reconstructor::new(options.clone());
    for hit in hits {
        reconstructor.push(hit);
    }
    reconstructor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::ArgValue;
    use std::collections::BTreeMap;

    fn hit(probe: &str, count: Option<i64>, ns: u64) -> Arc<ProbeHit> {
        let mut args = BTreeMap::new();
        if let Some(count) = count {
            args.insert("count".to_string(), ArgValue::Int(count));
        }
        Arc::new(ProbeHit {
            probe: probe.to_string(),
            pid: 1,
            tid: 1,
            comm: "mongod".to_string(),
            ns,
            cpu: 0,
            size: 36,
            args,
        })
    }

    #[test]
    fn test_nested_request() {
        let hits = vec![
            hit("requestX_start", Some(1), 1),
            hit("fieldA", None, 2),
            hit("requestX_start", Some(2), 3),
            hit("requestX_end", Some(2), 4),
            hit("requestX_end", Some(1), 5),
        ];
        let bundles = reconstruct(hits, &BundleOptions::default());
        assert_eq!(bundles.len(), 1);
        let top = &bundles[0];
        assert_eq!(top.status, BundleStatus::Closed);
        assert_eq!(top.counter, Some(1));
        assert_eq!(top.name.as_deref(), Some("requestX"));
        let leaves: Vec<&str> = top.leaves().map(|h| h.probe.as_str()).collect();
        assert_eq!(leaves, vec!["fieldA"]);
        let nested: Vec<&Bundle> = top.nested().collect();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].status, BundleStatus::Closed);
        assert_eq!(nested[0].counter, Some(2));
        assert_eq!(top.depth(), 2);
        assert_eq!(top.open_count(), 0);
        assert_eq!(top.hit_count(), 5);
        assert_eq!(top.duration_ns(), Some(4));
    }

    #[test]
    fn test_deep_nesting() {
        let depth = 6;
        let mut hits = Vec::new();
        let mut ns = 0;
        for i in 0..depth {
            ns += 1;
            hits.push(hit("req_start", Some(i), ns));
            ns += 1;
            hits.push(hit("work", None, ns));
        }
        for i in (0..depth).rev() {
            ns += 1;
            hits.push(hit("req_end", Some(i), ns));
        }
        let bundles = reconstruct(hits, &BundleOptions::default());
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].depth(), depth as usize);
        assert_eq!(bundles[0].open_count(), 0);
    }

    #[test]
    fn test_mismatched_end_is_a_leaf() {
        let hits = vec![
            hit("a_start", Some(1), 1),
            hit("a_end", Some(2), 2),
            hit("b_end", Some(1), 3),
            hit("a_end", Some(1), 4),
        ];
        let bundles = reconstruct(hits, &BundleOptions::default());
        assert_eq!(bundles.len(), 1);
        let leaves: Vec<&str> = bundles[0].leaves().map(|h| h.probe.as_str()).collect();
        assert_eq!(leaves, vec!["a_end", "b_end"]);
        assert_eq!(bundles[0].status, BundleStatus::Closed);
    }

    #[test]
    fn test_loose_hits() {
        let hits = vec![
            hit("x", None, 1),
            hit("y", None, 2),
            hit("a_start", Some(1), 3),
            hit("a_end", Some(1), 4),
            hit("z", None, 5),
        ];
        let bundles = reconstruct(hits, &BundleOptions::default());
        let statuses: Vec<BundleStatus> = bundles.iter().map(|b| b.status).collect();
        assert_eq!(
            statuses,
            vec![
                BundleStatus::Loose,
                BundleStatus::Closed,
                BundleStatus::Loose
            ]
        );
        assert_eq!(bundles[0].leaves().count(), 2);
        assert_eq!(bundles[2].leaves().count(), 1);
    }

    #[test]
    fn test_open_at_finish() {
        let mut reconstructor = Reconstructor::new(BundleOptions::default());
        reconstructor.push(hit("a_start", Some(1), 1));
        reconstructor.push(hit("a_start", Some(2), 2));
        assert_eq!(
            reconstructor.state(),
            ReconstructorState::Building { depth: 2 }
        );
        let bundles = reconstructor.finish();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].status, BundleStatus::Open);
        assert_eq!(bundles[0].open_count(), 2);
    }

    #[test]
    fn test_stale_spans_expire() {
        let options = BundleOptions {
            stale_after_ns: Some(100),
            ..Default::default()
        };
        let hits = vec![
            hit("a_start", Some(1), 0),
            hit("b_start", Some(1), 150),
            hit("c", None, 160),
            hit("b_end", Some(1), 170),
        ];
        let bundles = reconstruct(hits, &options);
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].status, BundleStatus::Expired);
        assert_eq!(bundles[0].name.as_deref(), Some("a"));
        assert_eq!(bundles[1].status, BundleStatus::Closed);
        assert_eq!(bundles[1].name.as_deref(), Some("b"));
    }

    #[test]
    fn test_custom_counter_arg() {
        let options = BundleOptions {
            counter_arg: "opCtx".to_string(),
            ..Default::default()
        };
        let mk = |probe: &str, op: u64, ns: u64| {
            let mut h = (*hit(probe, None, ns)).clone();
            h.args.insert("opCtx".to_string(), ArgValue::Pointer(op));
            Arc::new(h)
        };
        let hits = vec![mk("q_start", 7, 1), mk("q_end", 8, 2), mk("q_end", 7, 3)];
        let bundles = reconstruct(hits, &options);
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].counter, Some(7));
        assert_eq!(bundles[0].leaves().count(), 1);
    }
}
