//! Tagged payload values with one canonical JSON encoding.
//!
//! Payloads are heterogeneous by field kind, so every value carries its
//! kind tag on the wire: `{"t":"str","v":"hello"}`. Keys are held in a
//! `BTreeMap` so the serialized form is deterministic and safe to hash.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::identity::NodeId;

/// A single payload value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Unix milliseconds.
    TsMs(i64),
    Enum(String),
    ListStr(Vec<String>),
    ListInt(Vec<i64>),
    Ref {
        type_id: u32,
        id: NodeId,
    },
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "int64",
            Value::Float(_) => "float64",
            Value::Bool(_) => "bool",
            Value::TsMs(_) => "timestamp_ms",
            Value::Enum(_) => "enum",
            Value::ListStr(_) => "list<string>",
            Value::ListInt(_) => "list<int64>",
            Value::Ref { .. } => "ref",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }
}

/// Node payload / edge props: field name to tagged value.
pub type Payload = BTreeMap<String, Value>;

/// Shallow merge of `patch` into `base` by field name.
pub fn merge_payload(base: &mut Payload, patch: &Payload) {
    for (name, value) in patch {
        base.insert(name.clone(), value.clone());
    }
}
