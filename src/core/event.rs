//! Transaction events and envelope framing.
//!
//! One WAL record holds exactly one `TransactionEvent`: the atomic
//! operation group the coordinator resolved, plus identity and schema
//! metadata. The body encoding is canonical JSON (sorted map keys, fixed
//! field order); the envelope prefixes it with a one-byte version and a
//! little-endian length so the applier can reject truncated or
//! future-versioned records without parsing them.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256 as Sha2};
use thiserror::Error;

use super::identity::{ActorId, EventId, IdempotencyKey, NodeId, Principal, TenantId};
use super::value::Payload;

/// Envelope versions this build can decode.
pub const ENVELOPE_VERSION: u8 = 1;
pub const MIN_ENVELOPE_VERSION: u8 = 1;

const ENVELOPE_HEADER_LEN: usize = 5;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256(pub [u8; 32]);

impl Sha256 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub fn parse_hex(raw: &str) -> Option<Self> {
        if raw.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(out))
    }
}

impl fmt::Debug for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256({})", self.to_hex())
    }
}

pub fn sha256_bytes(data: &[u8]) -> Sha256 {
    let mut hasher = Sha2::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    Sha256(buf)
}

/// Schema fingerprint, rendered as `sha256:<hex>` everywhere it crosses
/// a boundary (requests, events, manifests, tenant_meta).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaFingerprint(pub Sha256);

impl SchemaFingerprint {
    pub fn parse(raw: &str) -> Option<Self> {
        let hex = raw.strip_prefix("sha256:")?;
        Sha256::parse_hex(hex).map(Self)
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0.to_hex())
    }
}

impl fmt::Debug for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaFingerprint({self})")
    }
}

impl Serialize for SchemaFingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaFingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SchemaFingerprint::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint {raw:?}")))
    }
}

/// A node position in an operation: a concrete id, or an alias declared
/// by an earlier `create_node` in the same transaction (`"$u"` /
/// `"$u.id"` on the wire). Alias is tried first on decode; node ids
/// reject the `$` prefix so the two forms cannot collide.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRef {
    Alias(AliasRef),
    Id(NodeId),
}

/// `$alias` or `$alias.id`; only the alias name is significant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasRef(String);

impl AliasRef {
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix('$')?;
        let name = rest.strip_suffix(".id").unwrap_or(rest);
        if name.is_empty() || name.contains('.') {
            return None;
        }
        Some(Self(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AliasRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.id", self.0)
    }
}

impl Serialize for AliasRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AliasRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AliasRef::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid alias ref {raw:?}")))
    }
}

impl NodeRef {
    pub fn id(&self) -> Option<&NodeId> {
        match self {
            NodeRef::Id(id) => Some(id),
            NodeRef::Alias(_) => None,
        }
    }
}

/// One operation inside an atomic transaction.
///
/// `node_id` on `CreateNode` is filled in by the coordinator before the
/// event is framed; an event whose create lacks an id, or that still
/// contains an alias ref, never came through coordination and is routed
/// to the dead-letter by the applier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateNode {
        type_id: u32,
        payload: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        principals: Vec<Principal>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        recipients: Vec<Principal>,
    },
    UpdateNode {
        node: NodeRef,
        patch: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<i64>,
    },
    DeleteNode {
        node: NodeRef,
    },
    CreateEdge {
        edge_type_id: u32,
        from: NodeRef,
        to: NodeRef,
        #[serde(default)]
        props: Payload,
    },
    DeleteEdge {
        edge_type_id: u32,
        from: NodeRef,
        to: NodeRef,
    },
    SetVisibility {
        node: NodeRef,
        principals: Vec<Principal>,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateNode { .. } => "create_node",
            Operation::UpdateNode { .. } => "update_node",
            Operation::DeleteNode { .. } => "delete_node",
            Operation::CreateEdge { .. } => "create_edge",
            Operation::DeleteEdge { .. } => "delete_edge",
            Operation::SetVisibility { .. } => "set_visibility",
        }
    }
}

/// The atomic transaction as appended to the WAL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub actor: ActorId,
    pub idempotency_key: IdempotencyKey,
    pub schema_fingerprint: SchemaFingerprint,
    pub created_at_ms: i64,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Error)]
pub enum EventCodecError {
    #[error("envelope truncated: {got} bytes")]
    Truncated { got: usize },
    #[error("envelope version {got} unsupported (min {min}, max {max})")]
    UnsupportedVersion { got: u8, min: u8, max: u8 },
    #[error("envelope length mismatch: declared {declared}, got {got}")]
    LengthMismatch { declared: usize, got: usize },
    #[error("event body encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("event body decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Canonical JSON bytes of the event body (no envelope).
pub fn encode_event_body(event: &TransactionEvent) -> Result<Vec<u8>, EventCodecError> {
    serde_json::to_vec(event).map_err(EventCodecError::Encode)
}

/// Frame an event: `[version u8][body_len u32 le][body]`.
pub fn encode_envelope(event: &TransactionEvent) -> Result<Vec<u8>, EventCodecError> {
    let body = encode_event_body(event)?;
    let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + body.len());
    buf.push(ENVELOPE_VERSION);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode an envelope produced by any version in the supported range.
pub fn decode_envelope(bytes: &[u8]) -> Result<TransactionEvent, EventCodecError> {
    if bytes.len() < ENVELOPE_HEADER_LEN {
        return Err(EventCodecError::Truncated { got: bytes.len() });
    }
    let version = bytes[0];
    if !(MIN_ENVELOPE_VERSION..=ENVELOPE_VERSION).contains(&version) {
        return Err(EventCodecError::UnsupportedVersion {
            got: version,
            min: MIN_ENVELOPE_VERSION,
            max: ENVELOPE_VERSION,
        });
    }
    let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let body = &bytes[ENVELOPE_HEADER_LEN..];
    if body.len() != declared {
        return Err(EventCodecError::LengthMismatch {
            declared,
            got: body.len(),
        });
    }
    serde_json::from_slice(body).map_err(EventCodecError::Decode)
}

/// Fingerprint of a request body, stored per idempotency key so a reused
/// key with a different body can be rejected.
pub fn request_fingerprint(
    tenant_id: &TenantId,
    actor: &ActorId,
    operations: &[Operation],
) -> Sha256 {
    let mut hasher = Sha2::new();
    hasher.update(tenant_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(actor.as_str().as_bytes());
    hasher.update([0u8]);
    // Operations at this point may still hold aliases; the fingerprint is
    // over the request as submitted, pre-resolution.
    let ops = serde_json::to_vec(operations).unwrap_or_default();
    hasher.update(&ops);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    Sha256(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;

    fn sample_event() -> TransactionEvent {
        let mut payload = Payload::new();
        payload.insert("email".into(), Value::Str("a@x".into()));
        TransactionEvent {
            event_id: EventId::new(),
            tenant_id: TenantId::parse("t1").unwrap(),
            actor: ActorId::parse("user:alice").unwrap(),
            idempotency_key: IdempotencyKey::parse("e2e-1").unwrap(),
            schema_fingerprint: SchemaFingerprint(sha256_bytes(b"schema")),
            created_at_ms: 1_700_000_000_000,
            operations: vec![
                Operation::CreateNode {
                    type_id: 1,
                    payload,
                    node_id: Some(NodeId::parse("n-1").unwrap()),
                    alias: Some("u".into()),
                    principals: vec![Principal::User("alice".into())],
                    recipients: vec![],
                },
                Operation::CreateEdge {
                    edge_type_id: 100,
                    from: NodeRef::Id(NodeId::parse("n-2").unwrap()),
                    to: NodeRef::Id(NodeId::parse("n-1").unwrap()),
                    props: Payload::new(),
                },
            ],
        }
    }

    #[test]
    fn envelope_roundtrip_preserves_event() {
        let event = sample_event();
        let bytes = encode_envelope(&event).unwrap();
        assert_eq!(bytes[0], ENVELOPE_VERSION);
        let back = decode_envelope(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn envelope_rejects_future_version() {
        let event = sample_event();
        let mut bytes = encode_envelope(&event).unwrap();
        bytes[0] = ENVELOPE_VERSION + 1;
        assert!(matches!(
            decode_envelope(&bytes),
            Err(EventCodecError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn envelope_rejects_length_mismatch() {
        let event = sample_event();
        let mut bytes = encode_envelope(&event).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            decode_envelope(&bytes),
            Err(EventCodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn alias_ref_parse_forms() {
        assert_eq!(AliasRef::parse("$u").unwrap().name(), "u");
        assert_eq!(AliasRef::parse("$u.id").unwrap().name(), "u");
        assert!(AliasRef::parse("u").is_none());
        assert!(AliasRef::parse("$").is_none());
        assert!(AliasRef::parse("$a.b.id").is_none());
    }

    #[test]
    fn node_ref_json_distinguishes_alias() {
        let alias: NodeRef = serde_json::from_str(r#""$t.id""#).unwrap();
        assert!(matches!(alias, NodeRef::Alias(ref a) if a.name() == "t"));
        let id: NodeRef = serde_json::from_str(r#""n-42""#).unwrap();
        assert!(matches!(id, NodeRef::Id(_)));
    }

    #[test]
    fn request_fingerprint_tracks_body() {
        let event = sample_event();
        let a = request_fingerprint(&event.tenant_id, &event.actor, &event.operations);
        let b = request_fingerprint(&event.tenant_id, &event.actor, &event.operations);
        assert_eq!(a, b);

        let mut other_ops = event.operations.clone();
        other_ops.pop();
        let c = request_fingerprint(&event.tenant_id, &event.actor, &other_ops);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_display_roundtrip() {
        let fp = SchemaFingerprint(sha256_bytes(b"x"));
        let rendered = fp.to_string();
        assert!(rendered.starts_with("sha256:"));
        assert_eq!(SchemaFingerprint::parse(&rendered).unwrap(), fp);
        assert!(SchemaFingerprint::parse("md5:abcd").is_none());
    }
}
