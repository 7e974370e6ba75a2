use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::chunks::TransferError;

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Int(i64),
    UInt(u64),
    Pointer(u64),
    Str(String),
    /// Long-string payload without a payload decoder.
    Bytes(Vec<u8>),
    /// Long-string payload decoded into a document.
    Document(serde_json::Value),
    /// Long-string payload the decoder rejected.
    Malformed(Vec<u8>),
    Struct(BTreeMap<String, ArgValue>),
    Transfer(TransferError),
}

impl ArgValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            ArgValue::UInt(v) | ArgValue::Pointer(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ArgValue::Int(v) => Some(*v as u64),
            ArgValue::UInt(v) | ArgValue::Pointer(v) => Some(*v),
            _ => None,
        }
    }
}

/// One decoded probe firing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeHit {
    pub probe: String,
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub ns: u64,
    pub cpu: i32,
    /// Size of the raw record in bytes.
    pub size: usize,
    pub args: BTreeMap<String, ArgValue>,
}

impl ProbeHit {
    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.get(name)
    }

    pub fn arg_i64(&self, name: &str) -> Option<i64> {
        self.arg(name).and_then(ArgValue::as_i64)
    }

    /// Every transfer failure recorded on this hit, nested structs included.
    pub fn transfer_errors(&self) -> Vec<TransferError> {
        fn walk(values: &BTreeMap<String, ArgValue>, out: &mut Vec<TransferError>) {
            for value in values.values() {
                match value {
                    ArgValue::Transfer(err) => out.push(*err),
                    ArgValue::Struct(fields) => walk(fields, out),
                    _ => {}
                }
            }
        }
        let mut errors = Vec::new();
        walk(&self.args, &mut errors);
        errors
    }
}

impl fmt::Display for ProbeHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {} | {} | {} | {} | {}",
            self.probe, self.comm, self.pid, self.tid, self.ns, self.cpu, self.size
        )
    }
}
