//! Protobuf-style schema compatibility between a deployed baseline and a
//! candidate.
//!
//! Allowed: add type, add field, add enum value, rename behind a stable
//! id, mark deprecated, drop `required`. Forbidden: remove anything,
//! change a field kind, remove or reorder enum values, change edge
//! endpoints, make a previously optional field required. Ids are never
//! reused - a renamed entry under an existing id is a rename, but the id
//! check is what keeps deploys honest.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::registry::SchemaDoc;
use super::types::{EdgeTypeDef, FieldDef, NodeTypeDef};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    // Non-breaking.
    NodeTypeAdded,
    EdgeTypeAdded,
    FieldAdded,
    PropAdded,
    EnumValueAdded,
    TypeDeprecated,
    FieldDeprecated,
    NameChanged,
    RequiredDropped,
    // Breaking.
    NodeTypeRemoved,
    EdgeTypeRemoved,
    FieldRemoved,
    PropRemoved,
    FieldKindChanged,
    EnumValueRemoved,
    EnumValueReordered,
    FromTypeChanged,
    ToTypeChanged,
    RequiredAdded,
}

impl ChangeKind {
    pub fn is_breaking(&self) -> bool {
        matches!(
            self,
            ChangeKind::NodeTypeRemoved
                | ChangeKind::EdgeTypeRemoved
                | ChangeKind::FieldRemoved
                | ChangeKind::PropRemoved
                | ChangeKind::FieldKindChanged
                | ChangeKind::EnumValueRemoved
                | ChangeKind::EnumValueReordered
                | ChangeKind::FromTypeChanged
                | ChangeKind::ToTypeChanged
                | ChangeKind::RequiredAdded
        )
    }
}

/// One detected difference between baseline and candidate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SchemaChange {
    pub kind: ChangeKind,
    /// e.g. `NodeType:User.field:email`
    pub path: String,
    pub message: String,
}

impl SchemaChange {
    fn new(kind: ChangeKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_breaking(&self) -> bool {
        self.kind.is_breaking()
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_breaking() { "BREAKING" } else { "OK" };
        write!(f, "[{status}] {:?}: {} - {}", self.kind, self.path, self.message)
    }
}

/// Diff `candidate` against `baseline` and return every change. Callers
/// decide policy; deploys fail when any change `is_breaking()`.
pub fn check_compatibility(baseline: &SchemaDoc, candidate: &SchemaDoc) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    let old_nodes: BTreeMap<u32, &NodeTypeDef> =
        baseline.node_types.iter().map(|t| (t.type_id, t)).collect();
    let new_nodes: BTreeMap<u32, &NodeTypeDef> =
        candidate.node_types.iter().map(|t| (t.type_id, t)).collect();
    let old_edges: BTreeMap<u32, &EdgeTypeDef> =
        baseline.edge_types.iter().map(|t| (t.edge_id, t)).collect();
    let new_edges: BTreeMap<u32, &EdgeTypeDef> =
        candidate.edge_types.iter().map(|t| (t.edge_id, t)).collect();

    for (type_id, old) in &old_nodes {
        match new_nodes.get(type_id) {
            None => changes.push(SchemaChange::new(
                ChangeKind::NodeTypeRemoved,
                format!("NodeType:{}", old.name),
                format!("node type {:?} (type_id={type_id}) was removed", old.name),
            )),
            Some(new) => diff_node_type(old, new, &mut changes),
        }
    }
    for (type_id, new) in &new_nodes {
        if !old_nodes.contains_key(type_id) {
            changes.push(SchemaChange::new(
                ChangeKind::NodeTypeAdded,
                format!("NodeType:{}", new.name),
                format!("node type {:?} (type_id={type_id}) added", new.name),
            ));
        }
    }

    for (edge_id, old) in &old_edges {
        match new_edges.get(edge_id) {
            None => changes.push(SchemaChange::new(
                ChangeKind::EdgeTypeRemoved,
                format!("EdgeType:{}", old.name),
                format!("edge type {:?} (edge_id={edge_id}) was removed", old.name),
            )),
            Some(new) => diff_edge_type(old, new, &mut changes),
        }
    }
    for (edge_id, new) in &new_edges {
        if !old_edges.contains_key(edge_id) {
            changes.push(SchemaChange::new(
                ChangeKind::EdgeTypeAdded,
                format!("EdgeType:{}", new.name),
                format!("edge type {:?} (edge_id={edge_id}) added", new.name),
            ));
        }
    }

    changes
}

fn diff_node_type(old: &NodeTypeDef, new: &NodeTypeDef, changes: &mut Vec<SchemaChange>) {
    let path = format!("NodeType:{}", old.name);

    if old.name != new.name {
        changes.push(SchemaChange::new(
            ChangeKind::NameChanged,
            &path,
            format!("renamed {:?} -> {:?}", old.name, new.name),
        ));
    }
    if !old.deprecated && new.deprecated {
        changes.push(SchemaChange::new(
            ChangeKind::TypeDeprecated,
            &path,
            format!("node type {:?} deprecated", old.name),
        ));
    }

    diff_fields(
        &old.fields,
        &new.fields,
        &path,
        ChangeKind::FieldAdded,
        ChangeKind::FieldRemoved,
        changes,
    );
}

fn diff_edge_type(old: &EdgeTypeDef, new: &EdgeTypeDef, changes: &mut Vec<SchemaChange>) {
    let path = format!("EdgeType:{}", old.name);

    if old.name != new.name {
        changes.push(SchemaChange::new(
            ChangeKind::NameChanged,
            &path,
            format!("renamed {:?} -> {:?}", old.name, new.name),
        ));
    }
    if !old.deprecated && new.deprecated {
        changes.push(SchemaChange::new(
            ChangeKind::TypeDeprecated,
            &path,
            format!("edge type {:?} deprecated", old.name),
        ));
    }
    if old.from_type_id != new.from_type_id {
        changes.push(SchemaChange::new(
            ChangeKind::FromTypeChanged,
            &path,
            format!("from_type_id {} -> {}", old.from_type_id, new.from_type_id),
        ));
    }
    if old.to_type_id != new.to_type_id {
        changes.push(SchemaChange::new(
            ChangeKind::ToTypeChanged,
            &path,
            format!("to_type_id {} -> {}", old.to_type_id, new.to_type_id),
        ));
    }

    diff_fields(
        &old.props,
        &new.props,
        &path,
        ChangeKind::PropAdded,
        ChangeKind::PropRemoved,
        changes,
    );
}

fn diff_fields(
    old_fields: &[FieldDef],
    new_fields: &[FieldDef],
    parent_path: &str,
    added_kind: ChangeKind,
    removed_kind: ChangeKind,
    changes: &mut Vec<SchemaChange>,
) {
    let old: BTreeMap<u32, &FieldDef> = old_fields.iter().map(|f| (f.field_id, f)).collect();
    let new: BTreeMap<u32, &FieldDef> = new_fields.iter().map(|f| (f.field_id, f)).collect();

    for (field_id, old_field) in &old {
        let path = format!("{parent_path}.field:{}", old_field.name);
        match new.get(field_id) {
            None => changes.push(SchemaChange::new(
                removed_kind,
                &path,
                format!(
                    "field {:?} (field_id={field_id}) was removed",
                    old_field.name
                ),
            )),
            Some(new_field) => diff_field(old_field, new_field, &path, changes),
        }
    }
    for (field_id, new_field) in &new {
        if !old.contains_key(field_id) {
            changes.push(SchemaChange::new(
                added_kind,
                format!("{parent_path}.field:{}", new_field.name),
                format!("field {:?} (field_id={field_id}) added", new_field.name),
            ));
        }
    }
}

fn diff_field(old: &FieldDef, new: &FieldDef, path: &str, changes: &mut Vec<SchemaChange>) {
    if old.name != new.name {
        changes.push(SchemaChange::new(
            ChangeKind::NameChanged,
            path,
            format!("renamed {:?} -> {:?}", old.name, new.name),
        ));
    }
    if old.kind != new.kind {
        changes.push(SchemaChange::new(
            ChangeKind::FieldKindChanged,
            path,
            format!("kind {} -> {}", old.kind, new.kind),
        ));
    }
    if !old.deprecated && new.deprecated {
        changes.push(SchemaChange::new(
            ChangeKind::FieldDeprecated,
            path,
            format!("field {:?} deprecated", old.name),
        ));
    }
    if !old.required && new.required {
        changes.push(SchemaChange::new(
            ChangeKind::RequiredAdded,
            path,
            "previously optional field became required".to_string(),
        ));
    }
    if old.required && !new.required {
        changes.push(SchemaChange::new(
            ChangeKind::RequiredDropped,
            path,
            "required dropped".to_string(),
        ));
    }

    diff_enum_values(old, new, path, changes);
}

fn diff_enum_values(old: &FieldDef, new: &FieldDef, path: &str, changes: &mut Vec<SchemaChange>) {
    if old.enum_values.is_empty() && new.enum_values.is_empty() {
        return;
    }
    // Existing values must appear unchanged, in order, as a prefix.
    if new.enum_values.len() < old.enum_values.len() {
        changes.push(SchemaChange::new(
            ChangeKind::EnumValueRemoved,
            path,
            format!(
                "enum shrank from {} to {} values",
                old.enum_values.len(),
                new.enum_values.len()
            ),
        ));
        return;
    }
    for (i, old_value) in old.enum_values.iter().enumerate() {
        if &new.enum_values[i] != old_value {
            let kind = if new.enum_values.contains(old_value) {
                ChangeKind::EnumValueReordered
            } else {
                ChangeKind::EnumValueRemoved
            };
            changes.push(SchemaChange::new(
                kind,
                path,
                format!("enum value {old_value:?} moved or removed at index {i}"),
            ));
            return;
        }
    }
    for added in &new.enum_values[old.enum_values.len()..] {
        changes.push(SchemaChange::new(
            ChangeKind::EnumValueAdded,
            path,
            format!("enum value {added:?} added"),
        ));
    }
}
