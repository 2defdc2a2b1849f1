//! Domain types shared by every component: identities, tagged payload
//! values, and the transaction event with its envelope codec.

pub mod event;
pub mod identity;
pub mod value;

pub use event::{
    decode_envelope, encode_envelope, encode_event_body, request_fingerprint, sha256_bytes,
    AliasRef, EventCodecError, NodeRef, Operation, SchemaFingerprint, Sha256, TransactionEvent,
    ENVELOPE_VERSION, MIN_ENVELOPE_VERSION,
};
pub use identity::{
    ActorId, CorrelationId, EventId, IdempotencyKey, InvalidId, NodeId, Principal, TenantId,
};
pub use value::{merge_payload, Payload, Value};

/// Wall-clock now in unix milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
