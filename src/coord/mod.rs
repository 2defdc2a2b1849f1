//! Transaction coordinator: validate, assign ids, resolve aliases, frame
//! one WAL record per transaction, append, return a receipt.
//!
//! Coordinator instances are stateless and parallel; ordering between
//! tenants is undefined and ordering within a tenant is the WAL's append
//! order. The inflight cache is per-instance soft state - a lost cache
//! only costs a duplicate append that `applied_events` deduplicates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::apply::AppliedTracker;
use crate::core::{
    now_ms, request_fingerprint, ActorId, AliasRef, EventCodecError, EventId, IdempotencyKey,
    NodeId, NodeRef, Operation, SchemaFingerprint, TenantId, TransactionEvent,
};
use crate::error::{ErrorCode, Transience};
use crate::schema::{expand_defaults, validate_patch, validate_payload, validate_props};
use crate::schema::{FieldError, RegistryError, SchemaRegistry};
use crate::store::{ConflictInfo, StoreError, TenantStores};
use crate::wal::{Wal, WalError, WalPosition};

mod inflight;

use inflight::{InflightCache, InflightEntry};

const INFLIGHT_CAPACITY: usize = 4_096;
const UNAVAILABLE_RETRY_BASE_MS: u64 = 50;

/// Validation errors for one operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OpValidation {
    pub op_index: usize,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("payload validation failed for {} operation(s)", errors.len())]
    Validation { errors: Vec<OpValidation> },
    #[error("version conflict on {node_id}: expected {expected}, observed {observed}")]
    Conflict {
        node_id: NodeId,
        expected: i64,
        observed: i64,
    },
    #[error("schema fingerprint mismatch: client {client}, server {server}")]
    FingerprintMismatch {
        client: SchemaFingerprint,
        server: SchemaFingerprint,
    },
    #[error("wal unavailable")]
    Unavailable {
        #[source]
        source: WalError,
    },
    #[error("deadline exceeded while {what}")]
    Timeout { what: &'static str },
    #[error(transparent)]
    Wal(WalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Codec(#[from] EventCodecError),
}

impl CoordError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordError::InvalidRequest { .. } | CoordError::FingerprintMismatch { .. } => {
                ErrorCode::InvalidRequest
            }
            CoordError::Validation { .. } => ErrorCode::ValidationError,
            CoordError::Conflict { .. } => ErrorCode::Conflict,
            CoordError::Unavailable { .. } => ErrorCode::ServiceUnavailable,
            CoordError::Timeout { .. } => ErrorCode::Timeout,
            CoordError::Wal(err) => match err {
                WalError::RecordTooLarge { .. } => ErrorCode::InvalidRequest,
                _ => ErrorCode::ServiceUnavailable,
            },
            CoordError::Store(_) | CoordError::Registry(_) | CoordError::Codec(_) => {
                ErrorCode::Internal
            }
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            CoordError::Unavailable { .. } | CoordError::Timeout { .. } => Transience::Retryable,
            CoordError::Wal(err) => err.transience(),
            CoordError::Store(err) => err.transience(),
            _ => Transience::Permanent,
        }
    }
}

/// An atomic execute request, already parsed off the wire.
#[derive(Clone, Debug)]
pub struct ExecuteRequest {
    pub tenant_id: TenantId,
    pub actor: ActorId,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Client-asserted fingerprint; mismatch rejects the request.
    pub schema_fingerprint: Option<SchemaFingerprint>,
    pub operations: Vec<Operation>,
    pub wait_for_applied: bool,
    pub deadline: Option<Duration>,
}

/// Coordinator's reply to an atomic execute.
#[derive(Clone, Debug, Serialize)]
pub struct Receipt {
    pub receipt_id: String,
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub wal_position: WalPosition,
    pub applied: bool,
    pub result_aliases: BTreeMap<String, NodeId>,
    pub created_nodes: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictInfo>,
}

pub struct Coordinator {
    wal: Arc<dyn Wal>,
    stores: Arc<TenantStores>,
    registry: Arc<SchemaRegistry>,
    applied: Arc<AppliedTracker>,
    inflight: InflightCache,
    id_seq: AtomicU64,
    default_deadline: Duration,
}

impl Coordinator {
    pub fn new(
        wal: Arc<dyn Wal>,
        stores: Arc<TenantStores>,
        registry: Arc<SchemaRegistry>,
        applied: Arc<AppliedTracker>,
        default_deadline: Duration,
    ) -> Self {
        Self {
            wal,
            stores,
            registry,
            applied,
            inflight: InflightCache::new(INFLIGHT_CAPACITY),
            id_seq: AtomicU64::new(1),
            default_deadline,
        }
    }

    /// Execute an atomic transaction end to end: dedupe, validate,
    /// assign, resolve, frame, append, and optionally wait for apply.
    pub fn execute(&self, request: ExecuteRequest) -> Result<Receipt, CoordError> {
        if request.operations.is_empty() {
            return Err(CoordError::InvalidRequest {
                reason: "operations list is empty".to_string(),
            });
        }
        let server_fingerprint = self.registry.fingerprint()?;
        if let Some(client) = request.schema_fingerprint {
            if client != server_fingerprint {
                return Err(CoordError::FingerprintMismatch {
                    client,
                    server: server_fingerprint,
                });
            }
        }

        let key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(IdempotencyKey::generate);
        let request_sha =
            request_fingerprint(&request.tenant_id, &request.actor, &request.operations);

        // Inflight check: a prior attempt pinned the assigned ids (and,
        // if its append was acknowledged, the position).
        if let Some(entry) = self.inflight.get(&request.tenant_id, &key) {
            if entry.request_sha != request_sha {
                return Err(CoordError::InvalidRequest {
                    reason: format!("idempotency key {key} reused with a different request body"),
                });
            }
            return self.finish(request, entry);
        }

        // Durable dedupe: the event may already have applied (e.g. this
        // coordinator restarted since the original attempt).
        if self.stores.exists(&request.tenant_id) {
            let store = self.stores.acquire(&request.tenant_id)?;
            if let Some((position, result)) = store.applied_result(&key)? {
                let position = position.unwrap_or_else(|| {
                    // Position unknown only for pre-position rows.
                    WalPosition::new(self.wal.partition_for_key(&request.tenant_id), 0)
                });
                return Ok(Receipt {
                    receipt_id: new_receipt_id(),
                    tenant_id: request.tenant_id,
                    idempotency_key: key,
                    wal_position: position,
                    applied: true,
                    result_aliases: result.aliases,
                    created_nodes: result.created_nodes,
                    conflicts: result.conflicts,
                });
            }
        }

        let operations = self.prepare_operations(&request)?;
        let event = TransactionEvent {
            event_id: EventId::new(),
            tenant_id: request.tenant_id.clone(),
            actor: request.actor.clone(),
            idempotency_key: key.clone(),
            schema_fingerprint: server_fingerprint,
            created_at_ms: now_ms(),
            operations,
        };
        let entry = InflightEntry {
            request_sha,
            event,
            position: None,
            receipt_id: new_receipt_id(),
        };
        self.inflight
            .insert(request.tenant_id.clone(), key, entry.clone());
        self.finish(request, entry)
    }

    /// Append (unless a prior attempt already did) and build the receipt.
    fn finish(&self, request: ExecuteRequest, entry: InflightEntry) -> Result<Receipt, CoordError> {
        let key = entry.event.idempotency_key.clone();
        let position = match entry.position {
            Some(position) => position,
            None => {
                let position = self.append_with_retry(&entry.event)?;
                self.inflight
                    .record_position(&request.tenant_id, &key, position);
                tracing::info!(
                    tenant = %request.tenant_id,
                    key = %key,
                    position = %position,
                    ops = entry.event.operations.len(),
                    "transaction appended"
                );
                position
            }
        };

        let mut receipt = Receipt {
            receipt_id: entry.receipt_id.clone(),
            tenant_id: request.tenant_id.clone(),
            idempotency_key: key.clone(),
            wal_position: position,
            applied: false,
            result_aliases: assigned_aliases(&entry.event),
            created_nodes: created_node_ids(&entry.event),
            conflicts: Vec::new(),
        };

        if request.wait_for_applied {
            let deadline = request.deadline.unwrap_or(self.default_deadline);
            if self.applied.wait_for(&request.tenant_id, position, deadline) {
                receipt.applied = true;
                let store = self.stores.acquire(&request.tenant_id)?;
                if let Some((_, result)) = store.applied_result(&key)? {
                    receipt.result_aliases = result.aliases;
                    receipt.created_nodes = result.created_nodes;
                    receipt.conflicts = result.conflicts;
                }
            }
            // Deadline elapsed: receipt goes back applied=false, not an
            // error.
        }

        Ok(receipt)
    }

    fn append_with_retry(&self, event: &TransactionEvent) -> Result<WalPosition, CoordError> {
        let bytes = crate::core::encode_envelope(event)?;
        match self.wal.append(&event.tenant_id, &bytes) {
            Ok(position) => Ok(position),
            Err(WalError::Unavailable { .. }) => {
                // One internal retry with jittered backoff, then surface.
                let jitter = u64::from(rand::random::<u8>()) % UNAVAILABLE_RETRY_BASE_MS;
                std::thread::sleep(Duration::from_millis(UNAVAILABLE_RETRY_BASE_MS + jitter));
                self.wal
                    .append(&event.tenant_id, &bytes)
                    .map_err(|err| match err {
                        WalError::Unavailable { .. } => CoordError::Unavailable { source: err },
                        other => CoordError::Wal(other),
                    })
            }
            Err(err) => Err(CoordError::Wal(err)),
        }
    }

    /// Steps 2-5: validation, default expansion, id assignment, alias
    /// resolution, and best-effort preflight against the store.
    fn prepare_operations(
        &self,
        request: &ExecuteRequest,
    ) -> Result<Vec<Operation>, CoordError> {
        let store = if self.stores.exists(&request.tenant_id) {
            Some(self.stores.acquire(&request.tenant_id)?)
        } else {
            None
        };

        let mut validation: Vec<OpValidation> = Vec::new();
        let mut aliases: BTreeMap<String, NodeId> = BTreeMap::new();
        let mut resolved = Vec::with_capacity(request.operations.len());

        for (op_index, op) in request.operations.iter().enumerate() {
            match op {
                Operation::CreateNode {
                    type_id,
                    payload,
                    node_id,
                    alias,
                    principals,
                    recipients,
                } => {
                    let Some(node_type) = self.registry.get_node_type(*type_id) else {
                        validation.push(OpValidation {
                            op_index,
                            errors: vec![unknown_type_error(*type_id)],
                        });
                        continue;
                    };
                    let mut payload = payload.clone();
                    expand_defaults(node_type, &mut payload);
                    let errors = validate_payload(&self.registry, node_type, &payload);
                    if !errors.is_empty() {
                        validation.push(OpValidation { op_index, errors });
                        continue;
                    }

                    let node_id = match node_id {
                        Some(id) => id.clone(),
                        None => NodeId::generate(self.id_seq.fetch_add(1, Ordering::Relaxed)),
                    };
                    if let Some(alias) = alias {
                        if aliases.contains_key(alias) {
                            return Err(CoordError::InvalidRequest {
                                reason: format!("alias {alias:?} declared twice"),
                            });
                        }
                        aliases.insert(alias.clone(), node_id.clone());
                    }
                    resolved.push(Operation::CreateNode {
                        type_id: *type_id,
                        payload,
                        node_id: Some(node_id),
                        alias: alias.clone(),
                        principals: principals.clone(),
                        recipients: recipients.clone(),
                    });
                }

                Operation::UpdateNode {
                    node,
                    patch,
                    expected_version,
                } => {
                    let node_id = resolve_ref(node, &aliases)?;
                    if let Some(store) = &store {
                        if let Some(head) = store.node_head(&node_id)? {
                            if let Some(expected) = expected_version {
                                if *expected != head.version {
                                    return Err(CoordError::Conflict {
                                        node_id,
                                        expected: *expected,
                                        observed: head.version,
                                    });
                                }
                            }
                            if let Some(node_type) = self.registry.get_node_type(head.type_id) {
                                let errors = validate_patch(&self.registry, node_type, patch);
                                if !errors.is_empty() {
                                    validation.push(OpValidation { op_index, errors });
                                    continue;
                                }
                            }
                        }
                    }
                    resolved.push(Operation::UpdateNode {
                        node: NodeRef::Id(node_id),
                        patch: patch.clone(),
                        expected_version: *expected_version,
                    });
                }

                Operation::DeleteNode { node } => {
                    let node_id = resolve_ref(node, &aliases)?;
                    resolved.push(Operation::DeleteNode {
                        node: NodeRef::Id(node_id),
                    });
                }

                Operation::CreateEdge {
                    edge_type_id,
                    from,
                    to,
                    props,
                } => {
                    let Some(edge_type) = self.registry.get_edge_type(*edge_type_id) else {
                        validation.push(OpValidation {
                            op_index,
                            errors: vec![unknown_edge_error(*edge_type_id)],
                        });
                        continue;
                    };
                    let errors = validate_props(&self.registry, &edge_type.props, props);
                    if !errors.is_empty() {
                        validation.push(OpValidation { op_index, errors });
                        continue;
                    }
                    let from_id = resolve_ref(from, &aliases)?;
                    let to_id = resolve_ref(to, &aliases)?;

                    // Endpoint type preflight, best effort: only nodes
                    // the store already has can be checked here; the
                    // applier enforces the invariant definitively.
                    if let Some(store) = &store {
                        for (label, node_id, expected) in [
                            ("from", &from_id, edge_type.from_type_id),
                            ("to", &to_id, edge_type.to_type_id),
                        ] {
                            if let Some(head) = store.node_head(node_id)? {
                                if head.type_id != expected {
                                    validation.push(OpValidation {
                                        op_index,
                                        errors: vec![FieldError {
                                            field: label.to_string(),
                                            reason: format!(
                                                "node {node_id} has type {} (edge wants {expected})",
                                                head.type_id
                                            ),
                                            suggestions: Vec::new(),
                                        }],
                                    });
                                }
                            }
                        }
                        if validation.last().map(|v| v.op_index) == Some(op_index) {
                            continue;
                        }
                    }

                    resolved.push(Operation::CreateEdge {
                        edge_type_id: *edge_type_id,
                        from: NodeRef::Id(from_id),
                        to: NodeRef::Id(to_id),
                        props: props.clone(),
                    });
                }

                Operation::DeleteEdge {
                    edge_type_id,
                    from,
                    to,
                } => {
                    let from_id = resolve_ref(from, &aliases)?;
                    let to_id = resolve_ref(to, &aliases)?;
                    resolved.push(Operation::DeleteEdge {
                        edge_type_id: *edge_type_id,
                        from: NodeRef::Id(from_id),
                        to: NodeRef::Id(to_id),
                    });
                }

                Operation::SetVisibility { node, principals } => {
                    let node_id = resolve_ref(node, &aliases)?;
                    resolved.push(Operation::SetVisibility {
                        node: NodeRef::Id(node_id),
                        principals: principals.clone(),
                    });
                }
            }
        }

        if !validation.is_empty() {
            return Err(CoordError::Validation { errors: validation });
        }
        Ok(resolved)
    }
}

fn resolve_ref(
    node_ref: &NodeRef,
    aliases: &BTreeMap<String, NodeId>,
) -> Result<NodeId, CoordError> {
    match node_ref {
        NodeRef::Id(id) => Ok(id.clone()),
        NodeRef::Alias(alias) => resolve_alias(alias, aliases),
    }
}

fn resolve_alias(
    alias: &AliasRef,
    aliases: &BTreeMap<String, NodeId>,
) -> Result<NodeId, CoordError> {
    aliases.get(alias.name()).cloned().ok_or_else(|| {
        CoordError::InvalidRequest {
            reason: format!(
                "alias {:?} is not bound by an earlier create_node in this transaction",
                alias.name()
            ),
        }
    })
}

fn assigned_aliases(event: &TransactionEvent) -> BTreeMap<String, NodeId> {
    let mut aliases = BTreeMap::new();
    for op in &event.operations {
        if let Operation::CreateNode {
            node_id: Some(node_id),
            alias: Some(alias),
            ..
        } = op
        {
            aliases.insert(alias.clone(), node_id.clone());
        }
    }
    aliases
}

fn created_node_ids(event: &TransactionEvent) -> Vec<NodeId> {
    event
        .operations
        .iter()
        .filter_map(|op| match op {
            Operation::CreateNode {
                node_id: Some(node_id),
                ..
            } => Some(node_id.clone()),
            _ => None,
        })
        .collect()
}

fn new_receipt_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn unknown_type_error(type_id: u32) -> FieldError {
    FieldError {
        field: "type_id".to_string(),
        reason: format!("type_id {type_id} not in active schema"),
        suggestions: Vec::new(),
    }
}

fn unknown_edge_error(edge_type_id: u32) -> FieldError {
    FieldError {
        field: "edge_type_id".to_string(),
        reason: format!("edge_type_id {edge_type_id} not in active schema"),
        suggestions: Vec::new(),
    }
}
