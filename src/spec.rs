//! Probe specifications.
//!
//! A [`ProbeSpec`] is the declarative description of one USDT probe: its name, the ordered list
//! of arguments it fires with, and the tuning knobs used by the code generator (sampling and
//! the chunk geometry for long-string payloads). Specs are validated once at construction and
//! are immutable afterwards; the code generator and the decode pipeline both trust them.
//!
//! Tools normally describe their probes in a JSON probe table, see [`ProbeTable`].

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Default size of one long-string chunk (2 MiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 2 * 1024 * 1024;

/// Default number of chunks in a long-string ring.
pub const DEFAULT_CHUNK_COUNT: u32 = 64;

/// Field names every output record starts with.
pub const RESERVED_FIELDS: [&str; 4] = ["comm", "pid", "tid", "ns"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpecError {
    #[error("probe {0} has more than one long string argument")]
    MultipleLongStrings(String),
    #[error("probe {probe}: struct {field} contains a long string")]
    NestedLongString { probe: String, field: String },
    #[error("'{0}' is not a valid C identifier")]
    InvalidName(String),
    #[error("probe {probe}: sampling fraction {fraction} is outside (0, 1]")]
    InvalidSampling { probe: String, fraction: f64 },
    #[error("probe {0}: chunk size and chunk count must be non-zero")]
    InvalidChunking(String),
    #[error("probe {probe}: long string {field} takes its length from argument {index}, which is not an integer argument")]
    BadLengthArg {
        probe: String,
        field: String,
        index: usize,
    },
    #[error("probe {probe}: output field {field} is generated more than once")]
    DuplicateField { probe: String, field: String },
    #[error("probe {probe}: argument {arg} is declared more than once")]
    DuplicateArg { probe: String, arg: String },
    #[error("probe {probe}: struct {field} has no fields")]
    EmptyStruct { probe: String, field: String },
    #[error("probe {probe}: string {field} has zero length")]
    ZeroLengthString { probe: String, field: String },
    #[error("probe {0} is defined more than once")]
    DuplicateProbe(String),
}

/// The kind of a probe argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 64-bit unsigned integer.
    ULong,
    /// Single byte.
    Char,
    /// Opaque pointer/handle, recorded but never dereferenced.
    Pointer,
    /// NUL terminated string copied into a fixed size buffer.
    Str { len: u32 },
    /// Variable length payload moved through the chunk ring. The length comes from another
    /// top-level argument when `len_arg` is set, otherwise from a 4 byte little-endian prefix of
    /// the payload itself.
    LongStr { len_arg: Option<usize> },
    /// Pointer to a structure in the target's memory.
    Struct { fields: Vec<ArgSpec> },
}

impl ArgKind {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ArgKind::Int | ArgKind::Long | ArgKind::ULong | ArgKind::Char
        )
    }
}

/// One argument of a probe, possibly a member of a nested structure.
///
/// `depth` and `index` are assigned when the owning [`ProbeSpec`] is built, together with the
/// mangled name of the output record field that carries the value.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    kind: ArgKind,
    name: Option<String>,
    depth: u32,
    index: u32,
    field_name: String,
}

impl ArgSpec {
    pub fn new(kind: ArgKind, name: Option<&str>) -> Self {
        ArgSpec {
            kind,
            name: name.map(str::to_string),
            depth: 0,
            index: 0,
            field_name: String::new(),
        }
    }

    pub fn int(name: &str) -> Self {
        Self::new(ArgKind::Int, Some(name))
    }

    pub fn long(name: &str) -> Self {
        Self::new(ArgKind::Long, Some(name))
    }

    pub fn ulong(name: &str) -> Self {
        Self::new(ArgKind::ULong, Some(name))
    }

    pub fn char(name: &str) -> Self {
        Self::new(ArgKind::Char, Some(name))
    }

    pub fn pointer(name: &str) -> Self {
        Self::new(ArgKind::Pointer, Some(name))
    }

    pub fn string(name: &str, len: u32) -> Self {
        Self::new(ArgKind::Str { len }, Some(name))
    }

    /// A length-prefixed payload.
    pub fn long_string(name: &str) -> Self {
        Self::new(ArgKind::LongStr { len_arg: None }, Some(name))
    }

    /// A payload whose length is passed as the top-level argument at `len_arg`.
    pub fn long_string_sized(name: &str, len_arg: usize) -> Self {
        Self::new(
            ArgKind::LongStr {
                len_arg: Some(len_arg),
            },
            Some(name),
        )
    }

    pub fn structure(name: &str, fields: Vec<ArgSpec>) -> Self {
        Self::new(ArgKind::Struct { fields }, Some(name))
    }

    pub fn kind(&self) -> &ArgKind {
        &self.kind
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The declared name, or `arg_<depth>_<index>` for unnamed arguments.
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("arg_{}_{}", self.depth, self.index),
        }
    }

    /// Name of the output record field (or mirror struct) carrying this argument. Nested
    /// members carry the index of every enclosing struct, innermost first.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn fields(&self) -> &[ArgSpec] {
        match &self.kind {
            ArgKind::Struct { fields } => fields,
            _ => &[],
        }
    }

    pub fn is_long_str(&self) -> bool {
        matches!(self.kind, ArgKind::LongStr { .. })
    }

    fn contains_long_str(&self) -> bool {
        self.fields()
            .iter()
            .any(|f| f.is_long_str() || f.contains_long_str())
    }

    fn position(&mut self, depth: u32, index: u32, suffix: &str) {
        self.depth = depth;
        self.index = index;
        self.field_name = format!("{}{}", self.name(), suffix);
        let child_suffix = format!("_{}{}", index, suffix);
        if let ArgKind::Struct { fields } = &mut self.kind {
            for (i, field) in fields.iter_mut().enumerate() {
                field.position(depth + 1, i as u32, &child_suffix);
            }
        }
    }
}

/// Per probe tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeTuning {
    /// Fraction of probe firings that emit an event, in (0, 1].
    pub sampling: f64,
    /// Size in bytes of one long-string chunk.
    pub chunk_size: u32,
    /// Number of chunks in the long-string ring.
    pub chunk_count: u32,
}

impl Default for ProbeTuning {
    fn default() -> Self {
        ProbeTuning {
            sampling: 1.0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_count: DEFAULT_CHUNK_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSpec {
    name: String,
    provider: Option<String>,
    args: Vec<ArgSpec>,
    tuning: ProbeTuning,
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

fn check_identifier(name: &str) -> Result<(), SpecError> {
    if identifier_re().is_match(name) {
        Ok(())
    } else {
        Err(SpecError::InvalidName(name.to_string()))
    }
}

impl ProbeSpec {
    /// Validate and position `args` for the probe `name`.
    pub fn build(name: &str, args: Vec<ArgSpec>, tuning: ProbeTuning) -> Result<Self, SpecError> {
        check_identifier(name)?;

        if !(tuning.sampling > 0.0 && tuning.sampling <= 1.0) {
            return Err(SpecError::InvalidSampling {
                probe: name.to_string(),
                fraction: tuning.sampling,
            });
        }

        let mut args = args;
        for (i, arg) in args.iter_mut().enumerate() {
            arg.position(0, i as u32, "");
        }

        let long_strs = args.iter().filter(|a| a.is_long_str()).count();
        if long_strs > 1 {
            return Err(SpecError::MultipleLongStrings(name.to_string()));
        }
        if long_strs == 1 && (tuning.chunk_size == 0 || tuning.chunk_count == 0) {
            return Err(SpecError::InvalidChunking(name.to_string()));
        }

        let spec = ProbeSpec {
            name: name.to_string(),
            provider: None,
            args,
            tuning,
        };
        spec.validate_args()?;
        Ok(spec)
    }

    /// Build with default tuning.
    pub fn new(name: &str, args: Vec<ArgSpec>) -> Result<Self, SpecError> {
        Self::build(name, args, ProbeTuning::default())
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    fn validate_args(&self) -> Result<(), SpecError> {
        let mut seen: HashSet<String> = RESERVED_FIELDS.iter().map(|s| s.to_string()).collect();
        let mut names: HashSet<String> = HashSet::new();
        for arg in self.args.iter() {
            // Decoded hits key their arguments by name.
            if !names.insert(arg.name()) {
                return Err(SpecError::DuplicateArg {
                    probe: self.name.clone(),
                    arg: arg.name(),
                });
            }
            if let ArgKind::LongStr {
                len_arg: Some(index),
            } = arg.kind
            {
                let ok = self
                    .args
                    .get(index)
                    .map(|a| a.kind.is_integer())
                    .unwrap_or(false);
                if !ok {
                    return Err(SpecError::BadLengthArg {
                        probe: self.name.clone(),
                        field: arg.name(),
                        index,
                    });
                }
            }
            self.validate_arg(arg, &mut seen)?;
        }
        Ok(())
    }

    fn validate_arg(&self, arg: &ArgSpec, seen: &mut HashSet<String>) -> Result<(), SpecError> {
        check_identifier(&arg.name())?;
        let duplicate = |field: &str| SpecError::DuplicateField {
            probe: self.name.clone(),
            field: field.to_string(),
        };
        match &arg.kind {
            ArgKind::Struct { fields } => {
                if fields.is_empty() {
                    return Err(SpecError::EmptyStruct {
                        probe: self.name.clone(),
                        field: arg.name(),
                    });
                }
                if arg.contains_long_str() {
                    return Err(SpecError::NestedLongString {
                        probe: self.name.clone(),
                        field: arg.name(),
                    });
                }
                for field in fields {
                    self.validate_arg(field, seen)?;
                }
            }
            ArgKind::LongStr { .. } => {
                for field in [
                    format!("{}_sz", arg.field_name()),
                    format!("{}_idx", arg.field_name()),
                ] {
                    if !seen.insert(field.clone()) {
                        return Err(duplicate(&field));
                    }
                }
            }
            ArgKind::Str { len } if *len == 0 => {
                return Err(SpecError::ZeroLengthString {
                    probe: self.name.clone(),
                    field: arg.name(),
                });
            }
            _ => {
                if !seen.insert(arg.field_name().to_string()) {
                    return Err(duplicate(arg.field_name()));
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    pub fn tuning(&self) -> &ProbeTuning {
        &self.tuning
    }

    pub fn sampling(&self) -> f64 {
        self.tuning.sampling
    }

    pub fn chunk_size(&self) -> u32 {
        self.tuning.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.tuning.chunk_count
    }

    /// The long-string argument, if the probe has one.
    pub fn long_str(&self) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.is_long_str())
    }
}

/// Overrides applied to every probe of a table that doesn't set its own value.
#[derive(Debug, Clone, Copy, Default)]
pub struct TuningOverrides {
    pub sampling: Option<f64>,
    pub chunk_size: Option<u32>,
    pub chunk_count: Option<u32>,
}

// The JSON probe table format is
// {
//   "provider": "mongodb",
//   "probes": [
//     {
//       "name": "probe_name",
//       "provider": "optional_override",
//       "sampling": 0.5,
//       "chunk_size": 1048576,
//       "chunk_count": 64,
//       "args": [
//         { "type": "int", "name": "count" },
//         { "type": "str", "name": "nss", "length": 50 },
//         { "type": "long_str", "name": "bson", "len_arg": 2 },
//         { "type": "struct", "name": "stats", "fields": [ ... ] }
//       ]
//     }
//   ]
// }
//
// Argument types are int, long, ulong, char, ptr, str, long_str and struct.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ProbeTableJson {
    provider: Option<String>,
    probes: Vec<ProbeJson>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ProbeJson {
    name: String,
    provider: Option<String>,
    args: Option<Vec<ArgJson>>,
    sampling: Option<f64>,
    chunk_size: Option<u32>,
    chunk_count: Option<u32>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ArgJson {
    Int {
        name: Option<String>,
    },
    Long {
        name: Option<String>,
    },
    Ulong {
        name: Option<String>,
    },
    Char {
        name: Option<String>,
    },
    Ptr {
        name: Option<String>,
    },
    Str {
        name: Option<String>,
        length: u32,
    },
    LongStr {
        name: Option<String>,
        len_arg: Option<usize>,
    },
    Struct {
        name: Option<String>,
        fields: Vec<ArgJson>,
    },
}

impl ArgJson {
    fn into_spec(self) -> ArgSpec {
        match self {
            ArgJson::Int { name } => ArgSpec::new(ArgKind::Int, name.as_deref()),
            ArgJson::Long { name } => ArgSpec::new(ArgKind::Long, name.as_deref()),
            ArgJson::Ulong { name } => ArgSpec::new(ArgKind::ULong, name.as_deref()),
            ArgJson::Char { name } => ArgSpec::new(ArgKind::Char, name.as_deref()),
            ArgJson::Ptr { name } => ArgSpec::new(ArgKind::Pointer, name.as_deref()),
            ArgJson::Str { name, length } => {
                ArgSpec::new(ArgKind::Str { len: length }, name.as_deref())
            }
            ArgJson::LongStr { name, len_arg } => {
                ArgSpec::new(ArgKind::LongStr { len_arg }, name.as_deref())
            }
            ArgJson::Struct { name, fields } => ArgSpec::new(
                ArgKind::Struct {
                    fields: fields.into_iter().map(ArgJson::into_spec).collect(),
                },
                name.as_deref(),
            ),
        }
    }
}

/// The probes a tool wants to attach to.
#[derive(Debug, Clone, Default)]
pub struct ProbeTable {
    pub provider: Option<String>,
    pub probes: Vec<Arc<ProbeSpec>>,
}

impl ProbeTable {
    pub fn from_json(buf: &str, overrides: &TuningOverrides) -> Result<Self> {
        let table: ProbeTableJson = serde_json::from_str(buf)?;
        let mut names = HashSet::new();
        let mut probes = Vec::with_capacity(table.probes.len());
        for probe in table.probes {
            if !names.insert(probe.name.clone()) {
                return Err(SpecError::DuplicateProbe(probe.name).into());
            }
            let defaults = ProbeTuning::default();
            let tuning = ProbeTuning {
                sampling: probe
                    .sampling
                    .or(overrides.sampling)
                    .unwrap_or(defaults.sampling),
                chunk_size: probe
                    .chunk_size
                    .or(overrides.chunk_size)
                    .unwrap_or(defaults.chunk_size),
                chunk_count: probe
                    .chunk_count
                    .or(overrides.chunk_count)
                    .unwrap_or(defaults.chunk_count),
            };
            let args = probe
                .args
                .unwrap_or_default()
                .into_iter()
                .map(ArgJson::into_spec)
                .collect();
            let mut spec = ProbeSpec::build(&probe.name, args, tuning)?;
            if let Some(provider) = probe.provider.as_deref() {
                spec = spec.with_provider(provider);
            }
            probes.push(Arc::new(spec));
        }
        Ok(ProbeTable {
            provider: table.provider,
            probes,
        })
    }

    pub fn load(path: &Path, overrides: &TuningOverrides) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("Failed to read probe table {}", path.display()))?;
        Self::from_json(&buf, overrides)
            .with_context(|| format!("Invalid probe table {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults() {
        let spec = ProbeSpec::new("aggRequestParse_start", vec![ArgSpec::int("count")]).unwrap();
        assert_eq!(spec.sampling(), 1.0);
        assert_eq!(spec.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(spec.chunk_count(), DEFAULT_CHUNK_COUNT);
        assert!(spec.long_str().is_none());
        assert_eq!(spec.args()[0].field_name(), "count");
    }

    #[test]
    fn test_multiple_long_strings() {
        let err = ProbeSpec::new(
            "two",
            vec![ArgSpec::long_string("a"), ArgSpec::long_string("b")],
        )
        .unwrap_err();
        assert_eq!(err, SpecError::MultipleLongStrings("two".to_string()));
    }

    #[test]
    fn test_nested_long_string() {
        let inner = ArgSpec::structure("inner", vec![ArgSpec::long_string("payload")]);
        let outer = ArgSpec::structure("outer", vec![ArgSpec::int("x"), inner]);
        let err = ProbeSpec::new("nested", vec![outer]).unwrap_err();
        assert!(matches!(err, SpecError::NestedLongString { .. }));
    }

    #[test]
    fn test_invalid_sampling() {
        let tuning = ProbeTuning {
            sampling: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            ProbeSpec::build("p", vec![], tuning),
            Err(SpecError::InvalidSampling { .. })
        ));
        let tuning = ProbeTuning {
            sampling: 1.5,
            ..Default::default()
        };
        assert!(ProbeSpec::build("p", vec![], tuning).is_err());
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(
            ProbeSpec::new("bad-name", vec![]),
            Err(SpecError::InvalidName(_))
        ));
        assert!(ProbeSpec::new("p", vec![ArgSpec::int("1x")]).is_err());
    }

    #[test]
    fn test_nested_field_names() {
        let a = ArgSpec::structure("a", vec![ArgSpec::int("x"), ArgSpec::int("y")]);
        let b = ArgSpec::structure(
            "b",
            vec![
                ArgSpec::int("x"),
                ArgSpec::structure("c", vec![ArgSpec::int("x")]),
            ],
        );
        let spec = ProbeSpec::new("p", vec![a, b]).unwrap();
        let a = &spec.args()[0];
        let b = &spec.args()[1];
        assert_eq!(a.fields()[0].field_name(), "x_0");
        assert_eq!(a.fields()[1].field_name(), "y_0");
        assert_eq!(b.fields()[0].field_name(), "x_1");
        let c = &b.fields()[1];
        assert_eq!(c.depth(), 1);
        assert_eq!(c.field_name(), "c_1");
        assert_eq!(c.fields()[0].field_name(), "x_1_1");
        assert_eq!(c.fields()[0].depth(), 2);
    }

    #[test]
    fn test_unnamed_args() {
        let args = vec![
            ArgSpec::new(ArgKind::Int, None),
            ArgSpec::new(
                ArgKind::Struct {
                    fields: vec![ArgSpec::new(ArgKind::Long, None)],
                },
                None,
            ),
        ];
        let spec = ProbeSpec::new("p", args).unwrap();
        assert_eq!(spec.args()[0].name(), "arg_0_0");
        assert_eq!(spec.args()[1].fields()[0].field_name(), "arg_1_0_1");
    }

    #[test]
    fn test_field_collision() {
        let s = ArgSpec::structure("s", vec![ArgSpec::int("x")]);
        let err = ProbeSpec::new("p", vec![s, ArgSpec::int("x_0")]).unwrap_err();
        assert!(matches!(err, SpecError::DuplicateField { .. }));

        let err = ProbeSpec::new("p", vec![ArgSpec::int("tid")]).unwrap_err();
        assert!(matches!(err, SpecError::DuplicateField { .. }));
    }

    #[test]
    fn test_duplicate_arg_names() {
        let args = vec![
            ArgSpec::int("x"),
            ArgSpec::structure("x", vec![ArgSpec::int("a")]),
        ];
        let err = ProbeSpec::new("p", args).unwrap_err();
        assert_eq!(
            err,
            SpecError::DuplicateArg {
                probe: "p".to_string(),
                arg: "x".to_string()
            }
        );
        assert!(ProbeSpec::new("p", vec![ArgSpec::int("x"), ArgSpec::long("x")]).is_err());
    }

    #[test]
    fn test_len_arg() {
        let ok = ProbeSpec::new(
            "p",
            vec![ArgSpec::int("sz"), ArgSpec::long_string_sized("str", 0)],
        );
        assert!(ok.is_ok());
        let err = ProbeSpec::new(
            "p",
            vec![ArgSpec::pointer("sz"), ArgSpec::long_string_sized("str", 0)],
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::BadLengthArg { index: 0, .. }));
        assert!(ProbeSpec::new("p", vec![ArgSpec::long_string_sized("str", 4)]).is_err());
    }

    #[test]
    fn test_probe_table_json() {
        let json = r#"
        {
            "provider": "mongodb",
            "probes": [
                {
                    "name": "aggRequestParse_start",
                    "args": [{ "type": "int", "name": "count" }]
                },
                {
                    "name": "findCmdRun",
                    "sampling": 0.5,
                    "args": [
                        { "type": "ptr", "name": "opCtx" },
                        { "type": "long_str", "name": "bson" }
                    ]
                },
                {
                    "name": "endQueryOp",
                    "provider": "other",
                    "args": [
                        { "type": "ptr", "name": "opCtx" },
                        { "type": "struct", "name": "summaryStats", "fields": [
                            { "type": "ulong", "name": "nReturned" },
                            { "type": "char", "name": "usedDisk" }
                        ]},
                        { "type": "str", "name": "nss", "length": 50 }
                    ]
                }
            ]
        }
        "#;
        let overrides = TuningOverrides {
            sampling: Some(0.25),
            chunk_size: Some(4096),
            chunk_count: None,
        };
        let table = ProbeTable::from_json(json, &overrides).unwrap();
        assert_eq!(table.provider.as_deref(), Some("mongodb"));
        assert_eq!(table.probes.len(), 3);
        assert_eq!(table.probes[0].sampling(), 0.25);
        assert_eq!(table.probes[1].sampling(), 0.5);
        assert_eq!(table.probes[1].chunk_size(), 4096);
        assert_eq!(table.probes[1].chunk_count(), DEFAULT_CHUNK_COUNT);
        assert_eq!(table.probes[2].provider(), Some("other"));
        assert_eq!(
            table.probes[2].args()[1].fields()[1].field_name(),
            "usedDisk_1"
        );
    }

    #[test]
    fn test_probe_table_duplicate() {
        let json = r#"
        {
            "probes": [
                { "name": "p" },
                { "name": "p" }
            ]
        }
        "#;
        assert!(ProbeTable::from_json(json, &TuningOverrides::default()).is_err());
    }

    #[test]
    fn test_probe_table_unknown_field() {
        let json = r#"{ "probes": [ { "name": "p", "bogus": 1 } ] }"#;
        assert!(ProbeTable::from_json(json, &TuningOverrides::default()).is_err());
    }
}
