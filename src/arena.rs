//! Hits correlated by an operation handle.
//!
//! Probes of one request usually carry the same opaque handle (`opCtx`). The arena groups hits by
//! that value until the consumer takes the operation out, or clears the arena.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::hit::ProbeHit;

#[derive(Debug, Clone, Default, Serialize)]
pub struct OpRecord {
    pub op: u64,
    pub hits: Vec<Arc<ProbeHit>>,
}

impl OpRecord {
    pub fn first_ns(&self) -> Option<u64> {
        self.hits.iter().map(|h| h.ns).min()
    }

    pub fn last_ns(&self) -> Option<u64> {
        self.hits.iter().map(|h| h.ns).max()
    }

    /// Whether `probe` fired for this operation.
    pub fn saw(&self, probe: &str) -> bool {
        self.hits.iter().any(|h| h.probe == probe)
    }
}

#[derive(Debug)]
pub struct OpArena {
    key: String,
    ops: Mutex<HashMap<u64, OpRecord>>,
}

impl OpArena {
    /// Correlate hits on the argument named `key`.
    pub fn new(key: &str) -> Self {
        OpArena {
            key: key.to_string(),
            ops: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// File `hit` under its operation. Returns the handle, or `None` when the hit doesn't carry
    /// the correlation argument.
    pub fn record(&self, hit: &Arc<ProbeHit>) -> Option<u64> {
        let op = hit.arg(&self.key)?.as_u64()?;
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        ops.entry(op)
            .or_insert_with(|| OpRecord {
                op,
                hits: Vec::new(),
            })
            .hits
            .push(hit.clone());
        Some(op)
    }

    pub fn take(&self, op: u64) -> Option<OpRecord> {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&op)
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every outstanding operation, ordered by first hit.
    pub fn clear(&self) -> Vec<OpRecord> {
        let mut ops: Vec<OpRecord> = self
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, record)| record)
            .collect();
        ops.sort_by_key(|r| (r.first_ns(), r.op));
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::ArgValue;
    use std::collections::BTreeMap;

    fn hit(probe: &str, op: Option<u64>, ns: u64) -> Arc<ProbeHit> {
        let mut args = BTreeMap::new();
        if let Some(op) = op {
            args.insert("opCtx".to_string(), ArgValue::Pointer(op));
        }
        Arc::new(ProbeHit {
            probe: probe.to_string(),
            pid: 1,
            tid: 1,
            comm: "mongod".to_string(),
            ns,
            cpu: 0,
            size: 40,
            args,
        })
    }

    #[test]
    fn test_record_and_take() {
        let arena = OpArena::new("opCtx");
        assert_eq!(arena.record(&hit("findCmdRun", Some(0x10), 5)), Some(0x10));
        assert_eq!(arena.record(&hit("endQueryOp", Some(0x10), 9)), Some(0x10));
        assert_eq!(arena.record(&hit("other", Some(0x20), 7)), Some(0x20));
        assert_eq!(arena.record(&hit("noop", None, 8)), None);
        assert_eq!(arena.len(), 2);

        let op = arena.take(0x10).unwrap();
        assert_eq!(op.hits.len(), 2);
        assert!(op.saw("endQueryOp"));
        assert_eq!(op.first_ns(), Some(5));
        assert_eq!(op.last_ns(), Some(9));
        assert!(arena.take(0x10).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_clear() {
        let arena = OpArena::new("opCtx");
        arena.record(&hit("a", Some(2), 20));
        arena.record(&hit("a", Some(1), 10));
        let ops = arena.clear();
        assert_eq!(ops.iter().map(|o| o.op).collect::<Vec<_>>(), vec![1, 2]);
        assert!(arena.is_empty());
    }
}
