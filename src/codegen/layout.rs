//! Byte layout of the packed output record each probe emits.
//!
//! The generated C declares `struct <probe>_output { ... } __attribute__((packed))`, so the
//! offsets here are a running sum of field sizes with no padding. The decoder reads events with
//! the same table, which keeps the two sides in lockstep.

use plain::Plain;

use crate::spec::{ArgKind, ArgSpec, ProbeSpec};

pub const COMM_LEN: usize = 16;

/// Common metadata at the start of every record.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EventHeader {
    pub comm: [u8; COMM_LEN],
    pub pid: u32,
    pub tid: u32,
    pub ns: u64,
}

unsafe impl Plain for EventHeader {}

pub const HEADER_SIZE: usize = std::mem::size_of::<EventHeader>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    I8,
    I32,
    I64,
    U64,
    Pointer,
    Bytes(usize),
    /// Long-string byte count or failure sentinel.
    ChunkLen,
    /// Long-string start chunk.
    ChunkIndex,
}

impl FieldKind {
    pub fn size(&self) -> usize {
        match self {
            FieldKind::I8 => 1,
            FieldKind::I32 | FieldKind::ChunkLen | FieldKind::ChunkIndex => 4,
            FieldKind::I64 | FieldKind::U64 | FieldKind::Pointer => 8,
            FieldKind::Bytes(n) => *n,
        }
    }

    /// C declaration of a record member of this kind.
    pub fn c_decl(&self, name: &str) -> String {
        match self {
            FieldKind::I8 => format!("__s8 {name}"),
            FieldKind::I32 | FieldKind::ChunkLen => format!("__s32 {name}"),
            FieldKind::I64 => format!("__s64 {name}"),
            FieldKind::U64 | FieldKind::Pointer => format!("__u64 {name}"),
            FieldKind::ChunkIndex => format!("__u32 {name}"),
            FieldKind::Bytes(n) => format!("char {name}[{n}]"),
        }
    }

    fn for_scalar(kind: &ArgKind) -> Option<FieldKind> {
        match kind {
            ArgKind::Int => Some(FieldKind::I32),
            ArgKind::Long => Some(FieldKind::I64),
            ArgKind::ULong => Some(FieldKind::U64),
            ArgKind::Char => Some(FieldKind::I8),
            ArgKind::Pointer => Some(FieldKind::Pointer),
            ArgKind::Str { len } => Some(FieldKind::Bytes(*len as usize)),
            ArgKind::LongStr { .. } | ArgKind::Struct { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub offset: usize,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    fields: Vec<FieldLayout>,
    size: usize,
}

impl OutputLayout {
    pub fn for_probe(spec: &ProbeSpec) -> Self {
        let mut layout = OutputLayout {
            fields: Vec::new(),
            size: HEADER_SIZE,
        };
        for arg in spec.args() {
            layout.add_arg(arg);
        }
        layout
    }

    fn push(&mut self, name: String, kind: FieldKind) {
        self.fields.push(FieldLayout {
            name,
            offset: self.size,
            kind,
        });
        self.size += kind.size();
    }

    fn add_arg(&mut self, arg: &ArgSpec) {
        match arg.kind() {
            ArgKind::Struct { fields } => {
                for field in fields {
                    self.add_arg(field);
                }
            }
            ArgKind::LongStr { .. } => {
                self.push(format!("{}_sz", arg.field_name()), FieldKind::ChunkLen);
                self.push(format!("{}_idx", arg.field_name()), FieldKind::ChunkIndex);
            }
            kind => {
                if let Some(field) = FieldKind::for_scalar(kind) {
                    self.push(arg.field_name().to_string(), field);
                }
            }
        }
    }

    /// Argument fields, in record order. The header is not included.
    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Total record size including the header.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// C type used for an argument inside a mirror of the target's structure.
pub(crate) fn mirror_c_type(kind: &ArgKind) -> &'static str {
    match kind {
        ArgKind::Int => "int",
        ArgKind::Long => "long long",
        ArgKind::ULong => "unsigned long long",
        ArgKind::Char => "char",
        ArgKind::Pointer => "__u64",
        ArgKind::Str { .. } => "char",
        ArgKind::LongStr { .. } | ArgKind::Struct { .. } => "",
    }
}
