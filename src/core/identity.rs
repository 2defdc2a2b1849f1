//! Identity atoms: tenants, nodes, actors, principals, idempotency keys.
//!
//! Names are validated at parse time so the rest of the crate can treat
//! them as infallible. Tenant ids double as directory names, so their
//! alphabet is restricted to path-safe characters.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid tenant id {raw:?}: {reason}")]
    Tenant { raw: String, reason: String },
    #[error("invalid node id {raw:?}: {reason}")]
    Node { raw: String, reason: String },
    #[error("invalid actor {raw:?}: {reason}")]
    Actor { raw: String, reason: String },
    #[error("invalid principal {raw:?}: {reason}")]
    Principal { raw: String, reason: String },
    #[error("invalid idempotency key: {reason}")]
    IdempotencyKey { reason: String },
}

const TENANT_MAX_LEN: usize = 128;
const IDEMPOTENCY_KEY_MAX_LEN: usize = 256;

macro_rules! parse_validated_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                $ty::parse(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Tenant identifier. Path-safe: `[A-Za-z0-9._-]`, 1..=128 chars,
/// never starting with a dot.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(String);

parse_validated_serde!(TenantId);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidId::Tenant {
                raw,
                reason: "empty".into(),
            });
        }
        if raw.len() > TENANT_MAX_LEN {
            return Err(InvalidId::Tenant {
                raw,
                reason: format!("longer than {TENANT_MAX_LEN} chars"),
            });
        }
        if raw.starts_with('.') {
            return Err(InvalidId::Tenant {
                raw,
                reason: "cannot start with '.'".into(),
            });
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
        {
            return Err(InvalidId::Tenant {
                raw: raw.clone(),
                reason: format!("character {c:?} not allowed"),
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({:?})", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node identifier, tenant-local and opaque.
///
/// The coordinator issues ids as 128 random bits plus a per-process
/// monotonic suffix. Anything non-empty without whitespace is accepted
/// on parse so externally supplied ids survive round-trips; `$` is
/// reserved for alias references.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

parse_validated_serde!(NodeId);

impl NodeId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidId::Node {
                raw,
                reason: "empty".into(),
            });
        }
        if raw.starts_with('$') {
            return Err(InvalidId::Node {
                raw,
                reason: "'$' prefix is reserved for alias references".into(),
            });
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(InvalidId::Node {
                raw,
                reason: "contains whitespace or control characters".into(),
            });
        }
        Ok(Self(raw))
    }

    /// Issue a fresh id: uuid v4 (simple form) plus a monotonic suffix.
    ///
    /// Only the coordinator calls this.
    pub(crate) fn generate(seq: u64) -> Self {
        Self(format!("{}-{:04x}", Uuid::new_v4().simple(), seq & 0xffff))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Actor identifier - non-empty string, no validation beyond that.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId(String);

parse_validated_serde!(ActorId);

impl ActorId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(InvalidId::Actor {
                raw,
                reason: "empty".into(),
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({:?})", self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ACL principal: `user:<id>`, `role:<id>`, or the tenant wildcard
/// `tenant:*`. A reader sees a node iff one of its principals is in the
/// node's acl set, or the reader is the owner.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Principal {
    User(String),
    Role(String),
    TenantWildcard,
}

impl Principal {
    pub fn parse(raw: &str) -> Result<Self, InvalidId> {
        let invalid = |reason: &str| InvalidId::Principal {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };
        match raw.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(Principal::User(id.to_string())),
            Some(("role", id)) if !id.is_empty() => Ok(Principal::Role(id.to_string())),
            Some(("tenant", "*")) => Ok(Principal::TenantWildcard),
            Some(("user", _)) | Some(("role", _)) => Err(invalid("empty id")),
            Some(("tenant", _)) => Err(invalid("only 'tenant:*' is supported")),
            Some((kind, _)) => Err(invalid(&format!("unknown principal kind {kind:?}"))),
            None => Err(invalid("expected 'kind:id'")),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Principal::User(_))
    }

    /// The full `user:<id>` string if this is a user principal.
    pub fn user_id(&self) -> Option<String> {
        match self {
            Principal::User(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(id) => write!(f, "user:{id}"),
            Principal::Role(id) => write!(f, "role:{id}"),
            Principal::TenantWildcard => f.write_str("tenant:*"),
        }
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Principal({self})")
    }
}

impl Serialize for Principal {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Principal::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Client-chosen key identifying a logical transaction across retries.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdempotencyKey(String);

parse_validated_serde!(IdempotencyKey);

impl IdempotencyKey {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidId::IdempotencyKey {
                reason: "empty".into(),
            });
        }
        if raw.len() > IDEMPOTENCY_KEY_MAX_LEN {
            return Err(InvalidId::IdempotencyKey {
                reason: format!("longer than {IDEMPOTENCY_KEY_MAX_LEN} chars"),
            });
        }
        Ok(Self(raw))
    }

    /// Server-generated key for requests that omitted one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({:?})", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique id of one WAL event.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Correlation id linking a request to its coordinator log line, WAL
/// record and applier log line.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_rejects_path_traversal() {
        assert!(TenantId::parse("..").is_err());
        assert!(TenantId::parse("a/b").is_err());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("t1").is_ok());
        assert!(TenantId::parse("acme-prod_2").is_ok());
    }

    #[test]
    fn node_id_rejects_alias_prefix() {
        assert!(NodeId::parse("$u.id").is_err());
        assert!(NodeId::parse("n 1").is_err());
        assert!(NodeId::parse("abc123").is_ok());
    }

    #[test]
    fn generated_node_ids_are_distinct() {
        let a = NodeId::generate(1);
        let b = NodeId::generate(2);
        assert_ne!(a, b);
        assert!(NodeId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn principal_parse_roundtrip() {
        for raw in ["user:42", "role:admin", "tenant:*"] {
            let p = Principal::parse(raw).unwrap();
            assert_eq!(p.to_string(), raw);
        }
        assert!(Principal::parse("user:").is_err());
        assert!(Principal::parse("tenant:all").is_err());
        assert!(Principal::parse("group:7").is_err());
        assert!(Principal::parse("noseparator").is_err());
    }

    #[test]
    fn principal_user_id() {
        let p = Principal::parse("user:42").unwrap();
        assert_eq!(p.user_id().as_deref(), Some("user:42"));
        assert_eq!(Principal::TenantWildcard.user_id(), None);
    }
}
