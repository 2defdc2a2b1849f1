//! Node and edge type definitions.
//!
//! Numeric ids are canonical and permanent: once a `(type_id, field_id)`
//! pair has shipped it is never removed or reassigned. Names are labels
//! and may be renamed. Enum value lists only grow.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Principal, Value};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TypeDefError {
    #[error("type_id must be in 1..=2^31-1, got {0}")]
    TypeIdOutOfRange(u32),
    #[error("edge_id must be in 1..=2^31-1, got {0}")]
    EdgeIdOutOfRange(u32),
    #[error("field_id must be in 1..=65535, got {0}")]
    FieldIdOutOfRange(u32),
    #[error("type name cannot be empty")]
    EmptyName,
    #[error("field name cannot be empty (field_id {0})")]
    EmptyFieldName(u32),
    #[error("duplicate field_id {field_id} in type {type_name:?}")]
    DuplicateFieldId { type_name: String, field_id: u32 },
    #[error("duplicate field name {field_name:?} in type {type_name:?}")]
    DuplicateFieldName {
        type_name: String,
        field_name: String,
    },
    #[error("enum field {0:?} requires enum_values")]
    EnumWithoutValues(String),
    #[error("ref field {0:?} requires ref_type_id")]
    RefWithoutTarget(String),
    #[error("default for field {field:?} does not match kind {kind}: {reason}")]
    DefaultKindMismatch {
        field: String,
        kind: FieldKind,
        reason: String,
    },
}

/// Field kinds supported by the schema, matching the tagged `Value`
/// variants one-to-one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int64,
    Float64,
    Bool,
    TimestampMs,
    Enum,
    ListString,
    ListInt64,
    Ref,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Int64 => "int64",
            FieldKind::Float64 => "float64",
            FieldKind::Bool => "bool",
            FieldKind::TimestampMs => "timestamp_ms",
            FieldKind::Enum => "enum",
            FieldKind::ListString => "list<string>",
            FieldKind::ListInt64 => "list<int64>",
            FieldKind::Ref => "ref",
        }
    }

    /// Whether `value` carries this kind. Int is accepted where float is
    /// expected, matching the wire JSON for whole floats.
    pub fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldKind::String, Value::Str(_))
                | (FieldKind::Int64, Value::Int(_))
                | (FieldKind::Float64, Value::Float(_))
                | (FieldKind::Float64, Value::Int(_))
                | (FieldKind::Bool, Value::Bool(_))
                | (FieldKind::TimestampMs, Value::TsMs(_))
                | (FieldKind::Enum, Value::Enum(_))
                | (FieldKind::ListString, Value::ListStr(_))
                | (FieldKind::ListInt64, Value::ListInt(_))
                | (FieldKind::Ref, Value::Ref { .. })
        )
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field of a node or edge type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub field_id: u32,
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_type_id: Option<u32>,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub deprecated: bool,
}

impl FieldDef {
    pub fn new(field_id: u32, name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            field_id,
            name: name.into(),
            kind,
            required: false,
            default: None,
            enum_values: Vec::new(),
            ref_type_id: None,
            indexed: false,
            searchable: false,
            deprecated: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ref_type(mut self, type_id: u32) -> Self {
        self.ref_type_id = Some(type_id);
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    fn check(&self) -> Result<(), TypeDefError> {
        if self.field_id == 0 || self.field_id > 65_535 {
            return Err(TypeDefError::FieldIdOutOfRange(self.field_id));
        }
        if self.name.is_empty() {
            return Err(TypeDefError::EmptyFieldName(self.field_id));
        }
        if self.kind == FieldKind::Enum && self.enum_values.is_empty() {
            return Err(TypeDefError::EnumWithoutValues(self.name.clone()));
        }
        if self.kind == FieldKind::Ref && self.ref_type_id.is_none() {
            return Err(TypeDefError::RefWithoutTarget(self.name.clone()));
        }
        if let Some(default) = &self.default {
            if !self.kind.matches(default) {
                return Err(TypeDefError::DefaultKindMismatch {
                    field: self.name.clone(),
                    kind: self.kind,
                    reason: format!("default is {}", default.kind_name()),
                });
            }
            if self.kind == FieldKind::Enum {
                if let Value::Enum(v) = default {
                    if !self.enum_values.contains(v) {
                        return Err(TypeDefError::DefaultKindMismatch {
                            field: self.name.clone(),
                            kind: self.kind,
                            reason: format!("default {v:?} not in enum_values"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

const MAX_TYPE_ID: u32 = i32::MAX as u32;

/// A node type: stable numeric id, label, ordered fields, default ACL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeDef {
    pub type_id: u32,
    pub name: String,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_acl: Vec<Principal>,
}

impl NodeTypeDef {
    pub fn new(type_id: u32, name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            type_id,
            name: name.into(),
            fields,
            deprecated: false,
            default_acl: Vec::new(),
        }
    }

    pub fn with_default_acl(mut self, acl: Vec<Principal>) -> Self {
        self.default_acl = acl;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn check(&self) -> Result<(), TypeDefError> {
        if self.type_id == 0 || self.type_id > MAX_TYPE_ID {
            return Err(TypeDefError::TypeIdOutOfRange(self.type_id));
        }
        if self.name.is_empty() {
            return Err(TypeDefError::EmptyName);
        }
        let mut seen_ids = std::collections::BTreeSet::new();
        let mut seen_names = std::collections::BTreeSet::new();
        for field in &self.fields {
            field.check()?;
            if !seen_ids.insert(field.field_id) {
                return Err(TypeDefError::DuplicateFieldId {
                    type_name: self.name.clone(),
                    field_id: field.field_id,
                });
            }
            if !seen_names.insert(field.name.as_str()) {
                return Err(TypeDefError::DuplicateFieldName {
                    type_name: self.name.clone(),
                    field_name: field.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_id(&self, field_id: u32) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.required && !f.deprecated)
    }

    pub fn searchable_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.searchable && !f.deprecated)
    }
}

/// A directed edge type between two node types.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeTypeDef {
    pub edge_id: u32,
    pub name: String,
    pub from_type_id: u32,
    pub to_type_id: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<FieldDef>,
    #[serde(default)]
    pub deprecated: bool,
}

impl EdgeTypeDef {
    pub fn new(
        edge_id: u32,
        name: impl Into<String>,
        from_type_id: u32,
        to_type_id: u32,
    ) -> Self {
        Self {
            edge_id,
            name: name.into(),
            from_type_id,
            to_type_id,
            props: Vec::new(),
            deprecated: false,
        }
    }

    pub fn with_props(mut self, props: Vec<FieldDef>) -> Self {
        self.props = props;
        self
    }

    pub fn check(&self) -> Result<(), TypeDefError> {
        if self.edge_id == 0 || self.edge_id > MAX_TYPE_ID {
            return Err(TypeDefError::EdgeIdOutOfRange(self.edge_id));
        }
        if self.name.is_empty() {
            return Err(TypeDefError::EmptyName);
        }
        let mut seen = std::collections::BTreeSet::new();
        for prop in &self.props {
            prop.check()?;
            if !seen.insert(prop.field_id) {
                return Err(TypeDefError::DuplicateFieldId {
                    type_name: self.name.clone(),
                    field_id: prop.field_id,
                });
            }
        }
        Ok(())
    }
}
