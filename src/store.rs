//! Per-thread, time ordered history of probe hits.
//!
//! Events from different CPUs reach user space through separate perf buffers, so hits of a single
//! thread can arrive slightly out of order. The store keeps one [`ThreadHistory`] per thread id
//! and puts each hit at its chronological position on insert, so readers never have to sort.
//!
//! ## Concurrency
//!
//! Buckets live in a `DashMap`; inserting goes through the entry API, which creates a missing
//! bucket and inserts the hit under the same shard lock. Two workers racing on a new thread id
//! therefore end up in the same bucket.
//!
//! ## Retention
//!
//! With a non-zero `max_hits_per_thread` the oldest hit of a thread is evicted once the bucket
//! grows past the cap. Evictions are counted as drops on that thread's history.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;

use crate::hit::ProbeHit;

#[derive(Debug, Default, Clone)]
pub struct ThreadHistory {
    hits: VecDeque<Arc<ProbeHit>>,
    reordered: u64,
    dropped: u64,
    capacity: usize,
}

impl ThreadHistory {
    pub fn new(capacity: usize) -> Self {
        ThreadHistory {
            capacity,
            ..Default::default()
        }
    }

    pub fn insert(&mut self, hit: Arc<ProbeHit>) {
        let in_order = self.hits.back().map_or(true, |last| last.ns <= hit.ns);
        if in_order {
            self.hits.push_back(hit);
        } else {
            self.reordered += 1;
            let pos = self
                .hits
                .iter()
                .rposition(|h| h.ns <= hit.ns)
                .map(|i| i + 1)
                .unwrap_or(0);
            self.hits.insert(pos, hit);
        }

        if self.capacity > 0 && self.hits.len() > self.capacity {
            self.hits.pop_front();
            self.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Newest hit by timestamp, not necessarily the last one inserted.
    pub fn last(&self) -> Option<&Arc<ProbeHit>> {
        self.hits.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProbeHit>> {
        self.hits.iter()
    }

    pub fn hits(&self) -> Vec<Arc<ProbeHit>> {
        self.hits.iter().cloned().collect()
    }

    /// Hits that arrived behind a later one.
    pub fn reordered(&self) -> u64 {
        self.reordered
    }

    /// Hits evicted by the retention cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Default)]
pub struct HitStore {
    threads: DashMap<u32, ThreadHistory>,
    max_hits_per_thread: usize,
}

impl HitStore {
    /// `max_hits_per_thread` of 0 keeps everything.
    pub fn new(max_hits_per_thread: usize) -> Self {
        HitStore {
            threads: DashMap::new(),
            max_hits_per_thread,
        }
    }

    pub fn insert(&self, hit: Arc<ProbeHit>) {
        let capacity = self.max_hits_per_thread;
        self.threads
            .entry(hit.tid)
            .or_insert_with(|| ThreadHistory::new(capacity))
            .insert(hit);
    }

    /// Thread ids with at least one hit, sorted.
    pub fn tids(&self) -> Vec<u32> {
        let mut tids: Vec<u32> = self.threads.iter().map(|e| *e.key()).collect();
        tids.sort_unstable();
        tids
    }

    /// Ordered copy of one thread's hits.
    pub fn history(&self, tid: u32) -> Option<ThreadHistory> {
        self.threads.get(&tid).map(|h| h.value().clone())
    }

    pub fn len(&self) -> usize {
        self.threads.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every history, keyed by thread id.
    pub fn snapshot(&self) -> BTreeMap<u32, ThreadHistory> {
        self.threads
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap as Map;
    use std::thread;

    fn hit(tid: u32, ns: u64) -> Arc<ProbeHit> {
        Arc::new(ProbeHit {
            probe: "p".to_string(),
            pid: 1,
            tid,
            comm: "test".to_string(),
            ns,
            cpu: 0,
            size: 32,
            args: Map::new(),
        })
    }

    fn timestamps(store: &HitStore, tid: u32) -> Vec<u64> {
        store
            .history(tid)
            .unwrap()
            .iter()
            .map(|h| h.ns)
            .collect()
    }

    #[test]
    fn test_restores_order() {
        let store = HitStore::new(0);
        for ns in [10, 30, 20, 40] {
            store.insert(hit(1, ns));
        }
        assert_eq!(timestamps(&store, 1), vec![10, 20, 30, 40]);
        assert_eq!(store.history(1).unwrap().reordered(), 1);
    }

    #[test]
    fn test_last_is_newest() {
        let mut history = ThreadHistory::new(0);
        assert!(history.last().is_none());
        for ns in [10, 40, 20] {
            history.insert(hit(1, ns));
        }
        assert_eq!(history.last().map(|h| h.ns), Some(40));
        history.insert(hit(1, 50));
        assert_eq!(history.last().map(|h| h.ns), Some(50));
    }

    #[test]
    fn test_insert_at_head() {
        let store = HitStore::new(0);
        for ns in [50, 60, 5] {
            store.insert(hit(1, ns));
        }
        assert_eq!(timestamps(&store, 1), vec![5, 50, 60]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut history = ThreadHistory::new(0);
        let a = hit(1, 10);
        let mut b = (*hit(1, 10)).clone();
        b.probe = "b".to_string();
        history.insert(hit(1, 20));
        history.insert(a);
        history.insert(Arc::new(b));
        let names: Vec<&str> = history.iter().map(|h| h.probe.as_str()).collect();
        assert_eq!(names, vec!["p", "b", "p"]);
    }

    #[test]
    fn test_threads_are_separate() {
        let store = HitStore::new(0);
        store.insert(hit(2, 5));
        store.insert(hit(1, 7));
        store.insert(hit(2, 3));
        assert_eq!(store.tids(), vec![1, 2]);
        assert_eq!(timestamps(&store, 2), vec![3, 5]);
        assert_eq!(store.len(), 3);
        assert!(store.history(3).is_none());
    }

    #[test]
    fn test_random_insertion_order() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let mut ts: Vec<u64> = (0..200).map(|_| rng.random_range(0..1000)).collect();
            ts.shuffle(&mut rng);
            let store = HitStore::new(0);
            for ns in &ts {
                store.insert(hit(9, *ns));
            }
            let got = timestamps(&store, 9);
            ts.sort_unstable();
            assert_eq!(got, ts);
        }
    }

    #[test]
    fn test_retention_cap() {
        let store = HitStore::new(3);
        for ns in [1, 2, 3, 4, 5] {
            store.insert(hit(1, ns));
        }
        let history = store.history(1).unwrap();
        assert_eq!(timestamps(&store, 1), vec![3, 4, 5]);
        assert_eq!(history.dropped(), 2);
    }

    #[test]
    fn test_concurrent_inserts() {
        let store = Arc::new(HitStore::new(0));
        let workers: Vec<_> = (0..4u64)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        store.insert(hit((i % 3) as u32, i * 4 + w));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(store.len(), 2000);
        for tid in store.tids() {
            let ts = timestamps(&store, tid);
            assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
