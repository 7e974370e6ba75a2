//! Decoding raw output records into [`ProbeHit`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use bson::{Bson, Document, RawDocument};
use clap::ValueEnum;
use log::debug;
use thiserror::Error;

use crate::chunks::{reassemble, ChunkGeometry, ChunkSource, TransferError};
use crate::codegen::layout::{EventHeader, FieldKind, HEADER_SIZE};
use crate::codegen::ProbeProgram;
use crate::hit::{ArgValue, ProbeHit};
use crate::spec::{ArgKind, ArgSpec};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("record has no field {0}")]
    MissingField(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

/// How a long-string payload carries its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFraming {
    /// The length came from a separate probe argument; the payload is the body alone.
    Sized,
    /// The payload starts with its own 4 byte little-endian length, which was copied along
    /// with it.
    Prefixed,
}

impl PayloadFraming {
    pub fn for_arg(arg: &ArgSpec) -> Self {
        match arg.kind() {
            ArgKind::LongStr { len_arg: Some(_) } => PayloadFraming::Sized,
            _ => PayloadFraming::Prefixed,
        }
    }
}

/// Turns reassembled long-string payloads into documents.
pub trait PayloadDecoder: Send + Sync {
    fn decode(
        &self,
        payload: &[u8],
        framing: PayloadFraming,
    ) -> Result<serde_json::Value, PayloadError>;
}

/// Document encodings understood for long-string payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PayloadFormat {
    Json,
    Bson,
}

impl PayloadFormat {
    pub fn decoder(self) -> Arc<dyn PayloadDecoder> {
        match self {
            PayloadFormat::Json => Arc::new(JsonPayloadDecoder),
            PayloadFormat::Bson => Arc::new(BsonPayloadDecoder),
        }
    }
}

/// Decodes JSON text, skipping the length prefix of self-describing payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadDecoder;

impl PayloadDecoder for JsonPayloadDecoder {
    fn decode(
        &self,
        payload: &[u8],
        framing: PayloadFraming,
    ) -> Result<serde_json::Value, PayloadError> {
        let body = match framing {
            PayloadFraming::Prefixed => payload
                .get(4..)
                .ok_or_else(|| PayloadError("payload shorter than its length prefix".into()))?,
            PayloadFraming::Sized => payload,
        };
        let end = body
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        serde_json::from_slice(&body[..end]).map_err(|e| PayloadError(e.to_string()))
    }
}

/// Decodes BSON documents into relaxed extended JSON.
///
/// A BSON document already starts with its own int32 length, so the payload is parsed whole
/// regardless of framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct BsonPayloadDecoder;

impl PayloadDecoder for BsonPayloadDecoder {
    fn decode(
        &self,
        payload: &[u8],
        _framing: PayloadFraming,
    ) -> Result<serde_json::Value, PayloadError> {
        let raw = RawDocument::from_bytes(payload).map_err(|e| PayloadError(e.to_string()))?;
        let doc = Document::try_from(raw).map_err(|e| PayloadError(e.to_string()))?;
        Ok(Bson::Document(doc).into_relaxed_extjson())
    }
}

fn read_bytes<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::Truncated {
            need: offset + N,
            have: data.len(),
        })
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub struct Decoder {
    program: ProbeProgram,
    chunks: Option<Box<dyn ChunkSource>>,
    payload: Option<Arc<dyn PayloadDecoder>>,
}

impl Decoder {
    pub fn new(
        program: ProbeProgram,
        chunks: Option<Box<dyn ChunkSource>>,
        payload: Option<Arc<dyn PayloadDecoder>>,
    ) -> Self {
        Decoder {
            program,
            chunks,
            payload,
        }
    }

    pub fn probe(&self) -> &str {
        self.program.name()
    }

    pub fn decode(&self, cpu: i32, data: &[u8]) -> Result<ProbeHit, DecodeError> {
        let layout = self.program.layout();
        if data.len() < layout.size() {
            return Err(DecodeError::Truncated {
                need: layout.size(),
                have: data.len(),
            });
        }

        let mut header = EventHeader::default();
        plain::copy_from_bytes(&mut header, &data[..HEADER_SIZE]).map_err(|_| {
            DecodeError::Truncated {
                need: HEADER_SIZE,
                have: data.len(),
            }
        })?;

        let mut args = BTreeMap::new();
        for arg in self.program.spec().args() {
            let value = self.decode_arg(arg, data)?;
            args.insert(arg.name(), value);
        }

        Ok(ProbeHit {
            probe: self.program.name().to_string(),
            pid: header.pid,
            tid: header.tid,
            comm: c_string(&header.comm),
            ns: header.ns,
            cpu,
            size: data.len(),
            args,
        })
    }

    fn field(&self, name: &str) -> Result<(usize, FieldKind), DecodeError> {
        self.program
            .layout()
            .field(name)
            .map(|f| (f.offset, f.kind))
            .ok_or_else(|| DecodeError::MissingField(name.to_string()))
    }

    fn decode_arg(&self, arg: &ArgSpec, data: &[u8]) -> Result<ArgValue, DecodeError> {
        if let ArgKind::Struct { fields } = arg.kind() {
            let mut members = BTreeMap::new();
            for field in fields {
                members.insert(field.name(), self.decode_arg(field, data)?);
            }
            return Ok(ArgValue::Struct(members));
        }
        if arg.is_long_str() {
            return self.decode_long_str(arg, data);
        }

        let (offset, kind) = self.field(arg.field_name())?;
        let value = match kind {
            FieldKind::I8 => ArgValue::Int(i8::from_ne_bytes(read_bytes(data, offset)?) as i64),
            FieldKind::I32 | FieldKind::ChunkLen => {
                ArgValue::Int(i32::from_ne_bytes(read_bytes(data, offset)?) as i64)
            }
            FieldKind::I64 => ArgValue::Int(i64::from_ne_bytes(read_bytes(data, offset)?)),
            FieldKind::U64 => ArgValue::UInt(u64::from_ne_bytes(read_bytes(data, offset)?)),
            FieldKind::ChunkIndex => {
                ArgValue::UInt(u32::from_ne_bytes(read_bytes(data, offset)?) as u64)
            }
            FieldKind::Pointer => ArgValue::Pointer(u64::from_ne_bytes(read_bytes(data, offset)?)),
            FieldKind::Bytes(n) => {
                let bytes = data.get(offset..offset + n).ok_or(DecodeError::Truncated {
                    need: offset + n,
                    have: data.len(),
                })?;
                ArgValue::Str(c_string(bytes))
            }
        };
        Ok(value)
    }

    fn decode_long_str(&self, arg: &ArgSpec, data: &[u8]) -> Result<ArgValue, DecodeError> {
        let (sz_offset, _) = self.field(&format!("{}_sz", arg.field_name()))?;
        let (idx_offset, _) = self.field(&format!("{}_idx", arg.field_name()))?;
        let sz = i32::from_ne_bytes(read_bytes(data, sz_offset)?);
        let idx = u32::from_ne_bytes(read_bytes(data, idx_offset)?);

        if let Some(err) = TransferError::from_sentinel(sz) {
            return Ok(ArgValue::Transfer(err));
        }
        let Some(chunks) = self.chunks.as_deref() else {
            return Ok(ArgValue::Transfer(TransferError::BadChunkIndex));
        };

        let spec = self.program.spec();
        let geometry = ChunkGeometry {
            size: spec.chunk_size(),
            count: spec.chunk_count(),
        };
        let payload = match reassemble(chunks, geometry, idx, sz as usize) {
            Ok(payload) => payload,
            Err(err) => return Ok(ArgValue::Transfer(err)),
        };

        let Some(decoder) = self.payload.as_ref() else {
            return Ok(ArgValue::Bytes(payload));
        };
        match decoder.decode(&payload, PayloadFraming::for_arg(arg)) {
            Ok(doc) => Ok(ArgValue::Document(doc)),
            Err(err) => {
                debug!("{}: malformed payload: {}", self.probe(), err);
                Ok(ArgValue::Malformed(payload))
            }
        }
    }
}
