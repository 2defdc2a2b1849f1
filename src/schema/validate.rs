//! Payload validation: a pure function over `(NodeTypeDef, payload)`.
//!
//! Unknown field names come back with nearest-name suggestions so a typo
//! like `emial` points at `email`.

use serde::Serialize;

use crate::core::{Payload, Value};

use super::registry::SchemaRegistry;
use super::types::{FieldKind, NodeTypeDef};

/// One per offending field.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl FieldError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
            suggestions: Vec::new(),
        }
    }
}

/// Validate a create payload against `node_type` within `registry` (the
/// registry is needed to resolve `ref` targets). Returns every field
/// error at once.
pub fn validate_payload(
    registry: &SchemaRegistry,
    node_type: &NodeTypeDef,
    payload: &Payload,
) -> Vec<FieldError> {
    validate_fields(registry, &node_type.fields, payload, true)
}

/// Validate an update patch: same checks minus required-field presence
/// (a patch only touches the fields it names).
pub fn validate_patch(
    registry: &SchemaRegistry,
    node_type: &NodeTypeDef,
    patch: &Payload,
) -> Vec<FieldError> {
    validate_fields(registry, &node_type.fields, patch, false)
}

/// Validate edge props against the edge type's prop definitions.
pub fn validate_props(
    registry: &SchemaRegistry,
    props_def: &[crate::schema::types::FieldDef],
    props: &Payload,
) -> Vec<FieldError> {
    validate_fields(registry, props_def, props, true)
}

fn validate_fields(
    registry: &SchemaRegistry,
    fields: &[crate::schema::types::FieldDef],
    payload: &Payload,
    check_required: bool,
) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for name in payload.keys() {
        if !fields.iter().any(|f| &f.name == name) {
            let mut err = FieldError::new(name, "unknown field");
            err.suggestions = suggest_names(fields, name);
            errors.push(err);
        }
    }

    for field in fields {
        let value = payload.get(&field.name);
        match value {
            None => {
                if check_required && field.required && field.default.is_none() {
                    errors.push(FieldError::new(&field.name, "required field is missing"));
                }
            }
            Some(value) => {
                if !field.kind.matches(value) {
                    errors.push(FieldError::new(
                        &field.name,
                        format!(
                            "expected {}, got {}",
                            field.kind,
                            value.kind_name()
                        ),
                    ));
                    continue;
                }
                if field.kind == FieldKind::Enum {
                    if let Value::Enum(v) = value {
                        if !field.enum_values.contains(v) {
                            errors.push(FieldError::new(
                                &field.name,
                                format!(
                                    "enum value {v:?} not in {:?}",
                                    field.enum_values
                                ),
                            ));
                        }
                    }
                }
                if let Value::Ref { type_id, .. } = value {
                    if registry.get_node_type(*type_id).is_none() {
                        errors.push(FieldError::new(
                            &field.name,
                            format!("ref type_id {type_id} does not resolve"),
                        ));
                    } else if let Some(expected) = field.ref_type_id {
                        if *type_id != expected {
                            errors.push(FieldError::new(
                                &field.name,
                                format!("ref must target type_id {expected}, got {type_id}"),
                            ));
                        }
                    }
                }
            }
        }
    }

    errors
}

/// Expand defaults into a create payload. Validation must have passed.
pub fn expand_defaults(node_type: &NodeTypeDef, payload: &mut Payload) {
    for field in &node_type.fields {
        if let Some(default) = &field.default {
            payload
                .entry(field.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
}

const SUGGESTION_MAX_DISTANCE: usize = 2;
const SUGGESTION_LIMIT: usize = 3;

fn suggest_names(fields: &[crate::schema::types::FieldDef], unknown: &str) -> Vec<String> {
    let mut candidates: Vec<(usize, &str)> = fields
        .iter()
        .filter(|f| !f.deprecated)
        .map(|f| (levenshtein(unknown, &f.name), f.name.as_str()))
        .filter(|(d, _)| *d <= SUGGESTION_MAX_DISTANCE)
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .take(SUGGESTION_LIMIT)
        .map(|(_, name)| name.to_string())
        .collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::FieldDef;

    fn registry_with_user() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register_node_type(NodeTypeDef::new(
                1,
                "User",
                vec![
                    FieldDef::new(1, "email", FieldKind::String).required(),
                    FieldDef::new(2, "name", FieldKind::String),
                    FieldDef::new(3, "status", FieldKind::Enum)
                        .with_enum_values(["active", "disabled"])
                        .with_default(Value::Enum("active".into())),
                    FieldDef::new(4, "manager", FieldKind::Ref).with_ref_type(1),
                ],
            ))
            .unwrap();
        registry
    }

    #[test]
    fn unknown_field_suggests_nearest() {
        let registry = registry_with_user();
        let ty = registry.get_node_type(1).unwrap();
        let mut payload = Payload::new();
        payload.insert("emial".into(), Value::Str("a@x".into()));
        payload.insert("email".into(), Value::Str("a@x".into()));

        let errors = validate_payload(&registry, ty, &payload);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "emial");
        assert_eq!(errors[0].suggestions, vec!["email".to_string()]);
    }

    #[test]
    fn missing_required_field_reported() {
        let registry = registry_with_user();
        let ty = registry.get_node_type(1).unwrap();
        let errors = validate_payload(&registry, ty, &Payload::new());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "email");
    }

    #[test]
    fn kind_mismatch_names_expected_and_actual() {
        let registry = registry_with_user();
        let ty = registry.get_node_type(1).unwrap();
        let mut payload = Payload::new();
        payload.insert("email".into(), Value::Int(3));
        let errors = validate_payload(&registry, ty, &payload);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("expected string"));
        assert!(errors[0].reason.contains("int64"));
    }

    #[test]
    fn enum_value_outside_set_rejected() {
        let registry = registry_with_user();
        let ty = registry.get_node_type(1).unwrap();
        let mut payload = Payload::new();
        payload.insert("email".into(), Value::Str("a@x".into()));
        payload.insert("status".into(), Value::Enum("paused".into()));
        let errors = validate_payload(&registry, ty, &payload);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "status");
    }

    #[test]
    fn ref_target_type_checked() {
        let registry = registry_with_user();
        let ty = registry.get_node_type(1).unwrap();
        let mut payload = Payload::new();
        payload.insert("email".into(), Value::Str("a@x".into()));
        payload.insert(
            "manager".into(),
            Value::Ref {
                type_id: 42,
                id: crate::core::NodeId::parse("n1").unwrap(),
            },
        );
        let errors = validate_payload(&registry, ty, &payload);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("does not resolve"));
    }

    #[test]
    fn defaults_expand_without_overwriting() {
        let registry = registry_with_user();
        let ty = registry.get_node_type(1).unwrap();
        let mut payload = Payload::new();
        payload.insert("email".into(), Value::Str("a@x".into()));
        expand_defaults(ty, &mut payload);
        assert_eq!(payload.get("status"), Some(&Value::Enum("active".into())));

        let mut payload = Payload::new();
        payload.insert("status".into(), Value::Enum("disabled".into()));
        expand_defaults(ty, &mut payload);
        assert_eq!(payload.get("status"), Some(&Value::Enum("disabled".into())));
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("emial", "email"), 2);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }
}
