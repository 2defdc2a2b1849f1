//! Canonical store: nodes, edges, acl, applied_events, tenant_meta.
//!
//! Everything here runs against the tenant's writer connection inside the
//! transaction opened by `TenantStore::apply_transaction`, or against a
//! short-lived read connection.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, params};

use crate::core::{
    AliasRef, NodeId, NodeRef, Operation, Payload, Principal, TransactionEvent,
};
use crate::schema::{expand_defaults, validate_patch, validate_payload, SchemaRegistry};

use super::mailbox::{self, SnippetExtractors};
use super::{ApplyAbort, ApplyResult, ConflictInfo, ReadAccess, StoreError};

pub(crate) fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS nodes (
           id TEXT PRIMARY KEY,
           type_id INTEGER NOT NULL,
           payload_json TEXT NOT NULL DEFAULT '{}',
           owner_actor TEXT NOT NULL,
           created_at INTEGER NOT NULL,
           updated_at INTEGER NOT NULL,
           deleted INTEGER NOT NULL DEFAULT 0,
           version INTEGER NOT NULL DEFAULT 1
         );
         CREATE INDEX IF NOT EXISTS nodes_by_type ON nodes (type_id);
         CREATE TABLE IF NOT EXISTS edges (
           edge_type_id INTEGER NOT NULL,
           from_id TEXT NOT NULL,
           to_id TEXT NOT NULL,
           props_json TEXT NOT NULL DEFAULT '{}',
           created_at INTEGER NOT NULL,
           PRIMARY KEY (edge_type_id, from_id, to_id)
         );
         CREATE INDEX IF NOT EXISTS edges_by_from ON edges (from_id, edge_type_id);
         CREATE INDEX IF NOT EXISTS edges_by_to ON edges (to_id, edge_type_id);
         CREATE TABLE IF NOT EXISTS acl (
           node_id TEXT NOT NULL,
           principal TEXT NOT NULL,
           PRIMARY KEY (node_id, principal)
         );
         CREATE TABLE IF NOT EXISTS applied_events (
           idempotency_key TEXT PRIMARY KEY,
           wal_position TEXT,
           result_json TEXT NOT NULL,
           applied_at INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS tenant_meta (
           k TEXT PRIMARY KEY,
           v TEXT NOT NULL
         );",
    )?;
    Ok(())
}

/// A node as read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRow {
    pub id: NodeId,
    pub type_id: u32,
    pub payload: Payload,
    pub owner_actor: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted: bool,
    pub version: i64,
    pub acl: Vec<Principal>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EdgeRow {
    pub edge_type_id: u32,
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub props: Payload,
    pub created_at: i64,
}

pub(crate) enum EdgeDir {
    Out,
    In,
}

/// Apply every operation of `event` in order. Mutations happen inside
/// the caller's savepoint; a conflict aborts with the marker and a hard
/// failure aborts the whole transaction.
pub(crate) fn apply_operations(
    conn: &Connection,
    registry: &SchemaRegistry,
    snippets: &SnippetExtractors,
    event: &TransactionEvent,
) -> Result<ApplyResult, ApplyAbort> {
    // Full alias map for the result object; resolution below still walks
    // sequentially so forward references fail.
    let assigned_aliases = collect_aliases(event)?;

    let mut result = ApplyResult {
        aliases: assigned_aliases.clone(),
        ..ApplyResult::default()
    };
    let mut visible_aliases: BTreeMap<String, NodeId> = BTreeMap::new();
    let conflict = |op_index: usize, node_id: NodeId, expected: Option<i64>, observed: Option<i64>, reason: &str| {
        ApplyAbort::Conflict(ApplyResult {
            aliases: assigned_aliases.clone(),
            created_nodes: Vec::new(),
            conflicts: vec![ConflictInfo {
                op_index,
                node_id,
                expected_version: expected,
                observed_version: observed,
                reason: reason.to_string(),
            }],
        })
    };

    for (op_index, op) in event.operations.iter().enumerate() {
        match op {
            Operation::CreateNode {
                type_id,
                payload,
                node_id,
                alias,
                principals,
                recipients,
            } => {
                let node_id = node_id.clone().ok_or_else(|| invariant("create_node without an assigned id"))?;
                let node_type = registry.get_node_type(*type_id).ok_or_else(|| {
                    invariant(&format!("type_id {type_id} not in active schema"))
                })?;

                let mut payload = payload.clone();
                expand_defaults(node_type, &mut payload);
                let errors = validate_payload(registry, node_type, &payload);
                if !errors.is_empty() {
                    return Err(invariant(&format!(
                        "payload for type {type_id} failed validation: {errors:?}"
                    )));
                }

                let payload_json = encode_payload(&payload)?;
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO nodes \
                     (id, type_id, payload_json, owner_actor, created_at, updated_at, deleted, version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, 1)",
                    params![
                        node_id.as_str(),
                        type_id,
                        payload_json,
                        event.actor.as_str(),
                        event.created_at_ms,
                    ],
                )?;
                if inserted == 0 {
                    return Err(invariant(&format!(
                        "node id {node_id} already exists"
                    )));
                }

                let acl: Vec<Principal> = if principals.is_empty() {
                    node_type.default_acl.clone()
                } else {
                    principals.clone()
                };
                replace_acl(conn, &node_id, &acl)?;

                for recipient in recipients {
                    if !recipient.is_user() {
                        continue;
                    }
                    mailbox::insert_fanout_item(
                        conn,
                        snippets,
                        event,
                        op_index,
                        recipient,
                        &node_id,
                        Some(node_type),
                        &payload,
                    )?;
                }

                if let Some(alias) = alias {
                    visible_aliases.insert(alias.clone(), node_id.clone());
                }
                result.created_nodes.push(node_id);
            }

            Operation::UpdateNode {
                node,
                patch,
                expected_version,
            } => {
                let node_id = resolve_ref(node, &visible_aliases)?;
                let Some(current) = load_node_head(conn, &node_id)? else {
                    return Err(conflict(op_index, node_id, *expected_version, None, "node not found"));
                };
                if current.deleted {
                    return Err(conflict(
                        op_index,
                        node_id,
                        *expected_version,
                        Some(current.version),
                        "node is deleted",
                    ));
                }
                if let Some(expected) = expected_version {
                    if *expected != current.version {
                        return Err(conflict(
                            op_index,
                            node_id,
                            Some(*expected),
                            Some(current.version),
                            "version mismatch",
                        ));
                    }
                }

                let node_type = registry.get_node_type(current.type_id).ok_or_else(|| {
                    invariant(&format!("type_id {} not in active schema", current.type_id))
                })?;
                let errors = validate_patch(registry, node_type, patch);
                if !errors.is_empty() {
                    return Err(invariant(&format!(
                        "patch for node {node_id} failed validation: {errors:?}"
                    )));
                }

                let mut payload = current.payload;
                crate::core::merge_payload(&mut payload, patch);
                conn.execute(
                    "UPDATE nodes SET payload_json = ?1, updated_at = ?2, version = version + 1 \
                     WHERE id = ?3",
                    params![encode_payload(&payload)?, event.created_at_ms, node_id.as_str()],
                )?;
            }

            Operation::DeleteNode { node } => {
                let node_id = resolve_ref(node, &visible_aliases)?;
                let Some(current) = load_node_head(conn, &node_id)? else {
                    return Err(conflict(op_index, node_id, None, None, "node not found"));
                };
                if current.deleted {
                    continue;
                }
                conn.execute(
                    "UPDATE nodes SET deleted = 1, updated_at = ?1, version = version + 1 \
                     WHERE id = ?2",
                    params![event.created_at_ms, node_id.as_str()],
                )?;
                // Soft delete cascades to the ACL; edges stay and are
                // hidden by traversals that exclude deleted endpoints.
                conn.execute("DELETE FROM acl WHERE node_id = ?1", params![node_id.as_str()])?;
            }

            Operation::CreateEdge {
                edge_type_id,
                from,
                to,
                props,
            } => {
                let edge_type = registry.get_edge_type(*edge_type_id).ok_or_else(|| {
                    invariant(&format!("edge_type_id {edge_type_id} not in active schema"))
                })?;
                let from_id = resolve_ref(from, &visible_aliases)?;
                let to_id = resolve_ref(to, &visible_aliases)?;

                for (label, node_id, expected_type) in [
                    ("from", &from_id, edge_type.from_type_id),
                    ("to", &to_id, edge_type.to_type_id),
                ] {
                    let Some(head) = load_node_head(conn, node_id)? else {
                        return Err(invariant(&format!(
                            "edge {edge_type_id} {label} endpoint {node_id} does not exist"
                        )));
                    };
                    if head.type_id != expected_type {
                        return Err(invariant(&format!(
                            "edge {edge_type_id} {label} endpoint {node_id} has type {} (want {expected_type})",
                            head.type_id
                        )));
                    }
                }

                let errors = crate::schema::validate::validate_props(registry, &edge_type.props, props);
                if !errors.is_empty() {
                    return Err(invariant(&format!(
                        "props for edge {edge_type_id} failed validation: {errors:?}"
                    )));
                }

                // Duplicate (edge_type, from, to) is a no-op.
                conn.execute(
                    "INSERT OR IGNORE INTO edges \
                     (edge_type_id, from_id, to_id, props_json, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        edge_type_id,
                        from_id.as_str(),
                        to_id.as_str(),
                        encode_payload(props)?,
                        event.created_at_ms,
                    ],
                )?;
            }

            Operation::DeleteEdge {
                edge_type_id,
                from,
                to,
            } => {
                let from_id = resolve_ref(from, &visible_aliases)?;
                let to_id = resolve_ref(to, &visible_aliases)?;
                // Missing edge is a no-op.
                conn.execute(
                    "DELETE FROM edges WHERE edge_type_id = ?1 AND from_id = ?2 AND to_id = ?3",
                    params![edge_type_id, from_id.as_str(), to_id.as_str()],
                )?;
            }

            Operation::SetVisibility { node, principals } => {
                let node_id = resolve_ref(node, &visible_aliases)?;
                let Some(current) = load_node_head(conn, &node_id)? else {
                    return Err(conflict(op_index, node_id, None, None, "node not found"));
                };
                if current.deleted {
                    return Err(conflict(
                        op_index,
                        node_id,
                        None,
                        Some(current.version),
                        "node is deleted",
                    ));
                }
                replace_acl(conn, &node_id, principals)?;
            }
        }
    }

    Ok(result)
}

fn invariant(reason: &str) -> ApplyAbort {
    ApplyAbort::Error(StoreError::InvariantViolation {
        reason: reason.to_string(),
    })
}

fn collect_aliases(event: &TransactionEvent) -> Result<BTreeMap<String, NodeId>, ApplyAbort> {
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
    Ok(aliases)
}

fn resolve_ref(
    node_ref: &NodeRef,
    visible: &BTreeMap<String, NodeId>,
) -> Result<NodeId, ApplyAbort> {
    match node_ref {
        NodeRef::Id(id) => Ok(id.clone()),
        NodeRef::Alias(alias) => resolve_alias(alias, visible),
    }
}

fn resolve_alias(
    alias: &AliasRef,
    visible: &BTreeMap<String, NodeId>,
) -> Result<NodeId, ApplyAbort> {
    visible.get(alias.name()).cloned().ok_or_else(|| {
        invariant(&format!(
            "alias {:?} not bound by an earlier create in this transaction",
            alias.name()
        ))
    })
}

/// The mutable head of a node: enough for version checks and merges.
pub struct NodeHead {
    pub type_id: u32,
    pub deleted: bool,
    pub version: i64,
    pub(crate) payload: Payload,
}

pub(crate) fn load_node_head(
    conn: &Connection,
    node_id: &NodeId,
) -> Result<Option<NodeHead>, StoreError> {
    let row: Option<(u32, String, i64, i64)> = conn
        .query_row(
            "SELECT type_id, payload_json, deleted, version FROM nodes WHERE id = ?1",
            params![node_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((type_id, payload_json, deleted, version)) => Ok(Some(NodeHead {
            type_id,
            payload: decode_payload(&payload_json)?,
            deleted: deleted != 0,
            version,
        })),
    }
}

fn replace_acl(conn: &Connection, node_id: &NodeId, acl: &[Principal]) -> Result<(), ApplyAbort> {
    conn.execute("DELETE FROM acl WHERE node_id = ?1", params![node_id.as_str()])?;
    for principal in acl {
        conn.execute(
            "INSERT OR IGNORE INTO acl (node_id, principal) VALUES (?1, ?2)",
            params![node_id.as_str(), principal.to_string()],
        )?;
    }
    Ok(())
}

pub(crate) fn encode_payload(payload: &Payload) -> Result<String, StoreError> {
    serde_json::to_string(payload).map_err(|e| StoreError::Corrupt {
        reason: format!("payload encode failed: {e}"),
    })
}

pub(crate) fn decode_payload(raw: &str) -> Result<Payload, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        reason: format!("payload decode failed: {e}"),
    })
}

// Read surface.

pub(crate) fn get_node(
    conn: &Connection,
    access: &ReadAccess,
    node_id: &NodeId,
    include_deleted: bool,
) -> Result<NodeRow, StoreError> {
    let Some(row) = load_node_row(conn, node_id)? else {
        return Err(StoreError::NotFound {
            node_id: node_id.clone(),
        });
    };
    if row.deleted && !include_deleted {
        return Err(StoreError::NotFound {
            node_id: node_id.clone(),
        });
    }
    if !is_visible(access, &row) {
        return Err(StoreError::Forbidden {
            actor: access.actor.clone(),
            node_id: node_id.clone(),
        });
    }
    Ok(row)
}

pub(crate) fn query_nodes(
    conn: &Connection,
    access: &ReadAccess,
    type_id: u32,
    filters: &Payload,
    limit: usize,
    offset: usize,
) -> Result<Vec<NodeRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, type_id, payload_json, owner_actor, created_at, updated_at, deleted, version \
         FROM nodes WHERE type_id = ?1 AND deleted = 0 \
         ORDER BY created_at DESC, id ASC",
    )?;
    let mut rows = stmt.query(params![type_id])?;
    let mut out = Vec::new();
    let mut skipped = 0usize;
    while let Some(row) = rows.next()? {
        let node = decode_node_row(conn, row)?;
        if !is_visible(access, &node) {
            continue;
        }
        if !matches_filters(&node.payload, filters) {
            continue;
        }
        if skipped < offset {
            skipped += 1;
            continue;
        }
        out.push(node);
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

pub(crate) fn edges(
    conn: &Connection,
    node_id: &NodeId,
    edge_type_id: Option<u32>,
    dir: EdgeDir,
) -> Result<Vec<EdgeRow>, StoreError> {
    let column = match dir {
        EdgeDir::Out => "from_id",
        EdgeDir::In => "to_id",
    };
    // Hide edges whose far endpoint is soft-deleted.
    let far = match dir {
        EdgeDir::Out => "to_id",
        EdgeDir::In => "from_id",
    };
    let sql = format!(
        "SELECT e.edge_type_id, e.from_id, e.to_id, e.props_json, e.created_at \
         FROM edges e JOIN nodes n ON n.id = e.{far} \
         WHERE e.{column} = ?1 AND n.deleted = 0 \
         AND (?2 IS NULL OR e.edge_type_id = ?2) \
         ORDER BY e.created_at ASC, e.edge_type_id ASC, e.from_id ASC, e.to_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![node_id.as_str(), edge_type_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let from_id: String = row.get(1)?;
        let to_id: String = row.get(2)?;
        let props_json: String = row.get(3)?;
        out.push(EdgeRow {
            edge_type_id: row.get(0)?,
            from_id: NodeId::parse(from_id)?,
            to_id: NodeId::parse(to_id)?,
            props: decode_payload(&props_json)?,
            created_at: row.get(4)?,
        });
    }
    Ok(out)
}

fn load_node_row(conn: &Connection, node_id: &NodeId) -> Result<Option<NodeRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, type_id, payload_json, owner_actor, created_at, updated_at, deleted, version \
         FROM nodes WHERE id = ?1",
    )?;
    let mut rows = stmt.query(params![node_id.as_str()])?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => Ok(Some(decode_node_row(conn, row)?)),
    }
}

fn decode_node_row(conn: &Connection, row: &rusqlite::Row<'_>) -> Result<NodeRow, StoreError> {
    let id: String = row.get(0)?;
    let payload_json: String = row.get(2)?;
    let deleted: i64 = row.get(6)?;
    let id = NodeId::parse(id)?;
    let acl = load_acl(conn, &id)?;
    Ok(NodeRow {
        payload: decode_payload(&payload_json)?,
        type_id: row.get(1)?,
        owner_actor: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        deleted: deleted != 0,
        version: row.get(7)?,
        acl,
        id,
    })
}

fn load_acl(conn: &Connection, node_id: &NodeId) -> Result<Vec<Principal>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT principal FROM acl WHERE node_id = ?1 ORDER BY principal ASC")?;
    let mut rows = stmt.query(params![node_id.as_str()])?;
    let mut acl = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        let principal = Principal::parse(&raw).map_err(|e| StoreError::Corrupt {
            reason: format!("stored principal invalid: {e}"),
        })?;
        acl.push(principal);
    }
    Ok(acl)
}

fn is_visible(access: &ReadAccess, node: &NodeRow) -> bool {
    if node.owner_actor == access.actor.as_str() {
        return true;
    }
    node.acl.iter().any(|p| {
        *p == Principal::TenantWildcard || access.principals.iter().any(|mine| mine == p)
    })
}

fn matches_filters(payload: &Payload, filters: &Payload) -> bool {
    filters
        .iter()
        .all(|(name, want)| payload.get(name) == Some(want))
}
