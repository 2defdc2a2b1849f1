//! Schema registry: the process-wide authority for type definitions.
//!
//! The registry is mutable during startup, then frozen before the server
//! accepts requests. The fingerprint is SHA-256 over the canonical JSON
//! form (types sorted by id, map keys sorted) and is what clients assert
//! against and what `tenant_meta` records per tenant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{sha256_bytes, SchemaFingerprint};

use super::types::{EdgeTypeDef, NodeTypeDef, TypeDefError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry is frozen; cannot register {name:?}")]
    Frozen { name: String },
    #[error("registry is not frozen yet; no fingerprint available")]
    NotFrozen,
    #[error("type_id {type_id} already registered as {existing:?}")]
    DuplicateTypeId { type_id: u32, existing: String },
    #[error("edge_id {edge_id} already registered as {existing:?}")]
    DuplicateEdgeId { edge_id: u32, existing: String },
    #[error("type name {name:?} already registered with id {existing_id}")]
    DuplicateName { name: String, existing_id: u32 },
    #[error(transparent)]
    TypeDef(#[from] TypeDefError),
    #[error("schema json invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema fingerprint encode failed: {0}")]
    Encode(String),
    #[error("dangling reference: {0}")]
    DanglingReference(String),
}

/// Serialized form of a whole schema, used for fingerprinting, the
/// `schema` CLI, and compatibility baselines on disk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub node_types: Vec<NodeTypeDef>,
    pub edge_types: Vec<EdgeTypeDef>,
}

pub struct SchemaRegistry {
    node_types: BTreeMap<u32, NodeTypeDef>,
    edge_types: BTreeMap<u32, EdgeTypeDef>,
    node_types_by_name: BTreeMap<String, u32>,
    edge_types_by_name: BTreeMap<String, u32>,
    fingerprint: Option<SchemaFingerprint>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            node_types: BTreeMap::new(),
            edge_types: BTreeMap::new(),
            node_types_by_name: BTreeMap::new(),
            edge_types_by_name: BTreeMap::new(),
            fingerprint: None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.fingerprint.is_some()
    }

    pub fn register_node_type(&mut self, node_type: NodeTypeDef) -> Result<(), RegistryError> {
        if self.is_frozen() {
            return Err(RegistryError::Frozen {
                name: node_type.name,
            });
        }
        node_type.check()?;
        if let Some(existing) = self.node_types.get(&node_type.type_id) {
            return Err(RegistryError::DuplicateTypeId {
                type_id: node_type.type_id,
                existing: existing.name.clone(),
            });
        }
        if let Some(&existing_id) = self.node_types_by_name.get(&node_type.name) {
            return Err(RegistryError::DuplicateName {
                name: node_type.name,
                existing_id,
            });
        }
        tracing::debug!(type_id = node_type.type_id, name = %node_type.name, "registered node type");
        self.node_types_by_name
            .insert(node_type.name.clone(), node_type.type_id);
        self.node_types.insert(node_type.type_id, node_type);
        Ok(())
    }

    pub fn register_edge_type(&mut self, edge_type: EdgeTypeDef) -> Result<(), RegistryError> {
        if self.is_frozen() {
            return Err(RegistryError::Frozen {
                name: edge_type.name,
            });
        }
        edge_type.check()?;
        if let Some(existing) = self.edge_types.get(&edge_type.edge_id) {
            return Err(RegistryError::DuplicateEdgeId {
                edge_id: edge_type.edge_id,
                existing: existing.name.clone(),
            });
        }
        if let Some(&existing_id) = self.edge_types_by_name.get(&edge_type.name) {
            return Err(RegistryError::DuplicateName {
                name: edge_type.name,
                existing_id,
            });
        }
        tracing::debug!(edge_id = edge_type.edge_id, name = %edge_type.name, "registered edge type");
        self.edge_types_by_name
            .insert(edge_type.name.clone(), edge_type.edge_id);
        self.edge_types.insert(edge_type.edge_id, edge_type);
        Ok(())
    }

    /// Cross-check edge endpoints and ref-field targets. Run after all
    /// registrations, before [`freeze`](Self::freeze).
    pub fn validate_all(&self) -> Result<(), RegistryError> {
        for edge in self.edge_types.values() {
            for (label, type_id) in [("from", edge.from_type_id), ("to", edge.to_type_id)] {
                if !self.node_types.contains_key(&type_id) {
                    return Err(RegistryError::DanglingReference(format!(
                        "edge {:?} (edge_id={}) references unknown {label}_type_id {type_id}",
                        edge.name, edge.edge_id
                    )));
                }
            }
        }
        for node in self.node_types.values() {
            for field in &node.fields {
                if let Some(target) = field.ref_type_id {
                    if !self.node_types.contains_key(&target) {
                        return Err(RegistryError::DanglingReference(format!(
                            "field {:?} of {:?} references unknown type_id {target}",
                            field.name, node.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Freeze the registry and compute the fingerprint. Irreversible.
    pub fn freeze(&mut self) -> Result<SchemaFingerprint, RegistryError> {
        if let Some(fp) = self.fingerprint {
            return Ok(fp);
        }
        self.validate_all()?;
        let doc = self.to_doc();
        let canonical = canonical_doc_bytes(&doc)?;
        let fp = SchemaFingerprint(sha256_bytes(&canonical));
        self.fingerprint = Some(fp);
        tracing::info!(
            node_types = self.node_types.len(),
            edge_types = self.edge_types.len(),
            fingerprint = %fp,
            "schema registry frozen"
        );
        Ok(fp)
    }

    pub fn fingerprint(&self) -> Result<SchemaFingerprint, RegistryError> {
        self.fingerprint.ok_or(RegistryError::NotFrozen)
    }

    pub fn get_node_type(&self, type_id: u32) -> Option<&NodeTypeDef> {
        self.node_types.get(&type_id)
    }

    pub fn get_node_type_by_name(&self, name: &str) -> Option<&NodeTypeDef> {
        self.node_types_by_name
            .get(name)
            .and_then(|id| self.node_types.get(id))
    }

    pub fn get_edge_type(&self, edge_id: u32) -> Option<&EdgeTypeDef> {
        self.edge_types.get(&edge_id)
    }

    pub fn get_edge_type_by_name(&self, name: &str) -> Option<&EdgeTypeDef> {
        self.edge_types_by_name
            .get(name)
            .and_then(|id| self.edge_types.get(id))
    }

    pub fn node_types(&self) -> impl Iterator<Item = &NodeTypeDef> {
        self.node_types.values()
    }

    pub fn edge_types(&self) -> impl Iterator<Item = &EdgeTypeDef> {
        self.edge_types.values()
    }

    /// Canonical document: types ascending by id (BTreeMap order).
    pub fn to_doc(&self) -> SchemaDoc {
        SchemaDoc {
            node_types: self.node_types.values().cloned().collect(),
            edge_types: self.edge_types.values().cloned().collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, RegistryError> {
        Ok(serde_json::to_string_pretty(&self.to_doc())?)
    }

    /// Rebuild a registry (not frozen) from its document form.
    pub fn from_doc(doc: SchemaDoc) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for node_type in doc.node_types {
            registry.register_node_type(node_type)?;
        }
        for edge_type in doc.edge_types {
            registry.register_edge_type(edge_type)?;
        }
        Ok(registry)
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        Self::from_doc(serde_json::from_str(json)?)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical bytes for fingerprinting: JSON with sorted object keys.
fn canonical_doc_bytes(doc: &SchemaDoc) -> Result<Vec<u8>, RegistryError> {
    // Round-trip through serde_json::Value to sort struct keys; enum
    // value order inside arrays is meaningful and preserved.
    let value = serde_json::to_value(doc).map_err(|e| RegistryError::Encode(e.to_string()))?;
    let sorted = sort_keys(value);
    serde_json::to_vec(&sorted).map_err(|e| RegistryError::Encode(e.to_string()))
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            serde_json::to_value(sorted).unwrap_or_default()
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{FieldDef, FieldKind};

    fn user_type() -> NodeTypeDef {
        NodeTypeDef::new(
            1,
            "User",
            vec![
                FieldDef::new(1, "email", FieldKind::String).required(),
                FieldDef::new(2, "name", FieldKind::String).searchable(),
            ],
        )
    }

    fn task_type() -> NodeTypeDef {
        NodeTypeDef::new(
            2,
            "Task",
            vec![
                FieldDef::new(1, "title", FieldKind::String).required().searchable(),
                FieldDef::new(2, "status", FieldKind::Enum)
                    .with_enum_values(["todo", "doing", "done"]),
            ],
        )
    }

    #[test]
    fn duplicate_type_id_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register_node_type(user_type()).unwrap();
        let dup = NodeTypeDef::new(1, "Other", vec![]);
        assert!(matches!(
            registry.register_node_type(dup),
            Err(RegistryError::DuplicateTypeId { type_id: 1, .. })
        ));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register_node_type(user_type()).unwrap();
        let dup = NodeTypeDef::new(9, "User", vec![]);
        assert!(matches!(
            registry.register_node_type(dup),
            Err(RegistryError::DuplicateName { .. })
        ));
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let mut registry = SchemaRegistry::new();
        registry.register_node_type(user_type()).unwrap();
        registry.freeze().unwrap();
        assert!(matches!(
            registry.register_node_type(task_type()),
            Err(RegistryError::Frozen { .. })
        ));
    }

    #[test]
    fn fingerprint_is_deterministic_and_id_ordered() {
        let mut a = SchemaRegistry::new();
        a.register_node_type(user_type()).unwrap();
        a.register_node_type(task_type()).unwrap();
        let fp_a = a.freeze().unwrap();

        // Register in the opposite order; fingerprint must not change.
        let mut b = SchemaRegistry::new();
        b.register_node_type(task_type()).unwrap();
        b.register_node_type(user_type()).unwrap();
        let fp_b = b.freeze().unwrap();

        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn fingerprint_changes_with_schema() {
        let mut a = SchemaRegistry::new();
        a.register_node_type(user_type()).unwrap();
        let fp_a = a.freeze().unwrap();

        let mut b = SchemaRegistry::new();
        b.register_node_type(user_type()).unwrap();
        b.register_node_type(task_type()).unwrap();
        let fp_b = b.freeze().unwrap();

        assert_ne!(fp_a, fp_b);
    }

    #[test]
    fn validate_all_catches_dangling_edge() {
        let mut registry = SchemaRegistry::new();
        registry.register_node_type(user_type()).unwrap();
        registry
            .register_edge_type(EdgeTypeDef::new(100, "AssignedTo", 2, 1))
            .unwrap();
        assert!(matches!(
            registry.validate_all(),
            Err(RegistryError::DanglingReference(_))
        ));
    }

    #[test]
    fn json_roundtrip_preserves_fingerprint() {
        let mut registry = SchemaRegistry::new();
        registry.register_node_type(user_type()).unwrap();
        registry.register_node_type(task_type()).unwrap();
        registry
            .register_edge_type(EdgeTypeDef::new(100, "AssignedTo", 2, 1))
            .unwrap();
        let json = registry.to_json().unwrap();
        let fp = registry.freeze().unwrap();

        let mut back = SchemaRegistry::from_json(&json).unwrap();
        assert_eq!(back.freeze().unwrap(), fp);
    }
}
