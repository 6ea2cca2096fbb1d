//! Intermediate representation emitted by the parser.
//!
//! An [`Op`] is one linear instruction: source line, operation name,
//! positional parameter tuple, and an optional binding to the API schema
//! that produced it. Control-flow jump targets are resolved instruction
//! indices by the time an [`OpList`] leaves the parser.
//!
//! Ops are immutable once emitted. The schema binding is runtime-only and
//! skipped during serialization.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::{ApiSchema, ParamType};

/// Operation mnemonics emitted by the parser for non-API constructs.
pub mod opnames {
    pub const SWITCH_DEVICE: &str = "switch_device";
    pub const COMMAND: &str = "command";
    pub const COMMENT: &str = "comment";
    pub const INCLUDE: &str = "include";
    pub const IF_NOT_GOTO: &str = "if_not_goto";
    pub const ELSEIF: &str = "elseif";
    pub const ELSE: &str = "else";
    pub const ENDIF: &str = "endif";
    pub const LOOP: &str = "loop";
    pub const UNTIL: &str = "until";

    /// Every mnemonic the executor handles without a registry lookup.
    pub const ALL: &[&str] = &[
        SWITCH_DEVICE,
        COMMAND,
        COMMENT,
        INCLUDE,
        IF_NOT_GOTO,
        ELSEIF,
        ELSE,
        ENDIF,
        LOOP,
        UNTIL,
    ];
}

/// A parameter scalar.
///
/// Option flags omitted from a call and carrying no schema default are
/// stored as [`Value::Null`] so the tuple keeps the declared arity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
    Null,
}

impl Value {
    /// Renders the value as text; `Null` renders empty.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Null => String::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// Errors raised during typed parameter access.
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("required parameter '{alias}' is missing")]
    Missing { alias: String },

    #[error("parameter '{alias}' is not an integer: '{text}'")]
    NotAnInt { alias: String, text: String },
}

/// One IR instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub line: u32,
    pub name: String,
    pub params: Vec<Value>,
    /// Schema binding for typed named access; absent for mnemonics and
    /// after deserialization.
    #[serde(skip)]
    pub api: Option<Arc<ApiSchema>>,
}

impl Op {
    pub fn new(line: u32, name: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            line,
            name: name.into(),
            params,
            api: None,
        }
    }

    pub fn with_api(mut self, api: Arc<ApiSchema>) -> Self {
        self.api = Some(api);
        self
    }

    /// Typed view over the parameter tuple.
    pub fn view(&self) -> ParamView<'_> {
        ParamView { op: self }
    }
}

// Structural equality ignores the schema binding: two compilations of the
// same script must compare equal even though the bindings are distinct Arcs.
impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.line == other.line && self.name == other.name && self.params == other.params
    }
}

impl Eq for Op {}

/// The linear instruction list for one script.
pub type OpList = Vec<Op>;

/// Output of compiling one script file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledScript {
    /// Source file name, for diagnostics and cycle detection.
    pub file: String,
    pub ops: OpList,
    /// Section names seen, in first-appearance order.
    pub devices: Vec<String>,
    /// Include paths seen, in first-appearance order.
    pub includes: Vec<String>,
}

/// Positional and schema-aware named access to an op's parameters.
///
/// Named access resolves an alias to its declared tuple position and
/// coerces per the declared type: `string` as-is, `int` parsed from
/// decimal (failure is a runtime error), identifier/variable as text.
#[derive(Debug, Clone, Copy)]
pub struct ParamView<'a> {
    op: &'a Op,
}

impl<'a> ParamView<'a> {
    pub fn len(&self) -> usize {
        self.op.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.op.params.is_empty()
    }

    pub fn positional(&self, idx: usize) -> Option<&'a Value> {
        self.op.params.get(idx)
    }

    /// Text of the parameter at `idx`; `None` when out of range or null.
    pub fn text_at(&self, idx: usize) -> Option<String> {
        match self.op.params.get(idx) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.to_text()),
        }
    }

    fn named_value(&self, alias: &str) -> Option<&'a Value> {
        let api = self.op.api.as_ref()?;
        if api.open_options {
            // Open-options ops store `(flag, value)` pairs in appearance
            // order; match the alias against the flag without its dash.
            let mut pairs = self.op.params.chunks_exact(2);
            return pairs.find_map(|pair| match &pair[0] {
                Value::Str(flag) if flag.trim_start_matches('-') == alias => Some(&pair[1]),
                _ => None,
            });
        }
        let (idx, _) = api.option_by_alias(alias)?;
        self.op.params.get(idx)
    }

    /// Named text access; `None` when the flag is absent or null.
    pub fn named_text(&self, alias: &str) -> Option<String> {
        match self.named_value(alias) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.to_text()),
        }
    }

    /// Named integer access with decimal coercion.
    pub fn named_int(&self, alias: &str) -> Result<Option<i64>, ParamError> {
        match self.named_value(alias) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Int(i)) => Ok(Some(*i)),
            Some(Value::Str(s)) => s.trim().parse().map(Some).map_err(|_| ParamError::NotAnInt {
                alias: alias.to_string(),
                text: s.clone(),
            }),
        }
    }

    pub fn require_text(&self, alias: &str) -> Result<String, ParamError> {
        self.named_text(alias).ok_or_else(|| ParamError::Missing {
            alias: alias.to_string(),
        })
    }

    pub fn require_int(&self, alias: &str) -> Result<i64, ParamError> {
        self.named_int(alias)?.ok_or_else(|| ParamError::Missing {
            alias: alias.to_string(),
        })
    }

    /// `(flag, value)` pairs of an open-options op.
    pub fn open_pairs(&self) -> Vec<(String, String)> {
        self.op
            .params
            .chunks_exact(2)
            .filter_map(|pair| match &pair[0] {
                Value::Str(flag) => Some((flag.clone(), pair[1].to_text())),
                _ => None,
            })
            .collect()
    }

    /// Checks whether the bound schema declares the given type for an alias.
    pub fn declared_type(&self, alias: &str) -> Option<ParamType> {
        let api = self.op.api.as_ref()?;
        api.option_by_alias(alias).map(|(_, p)| p.ty)
    }
}
