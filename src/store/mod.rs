//! Per-tenant embedded stores: a canonical graph database and a mailbox
//! database with full-text search, both SQLite.
//!
//! Layout on disk: `<data_dir>/<tenant>/canonical.db` and `mailbox.db`.
//! The mailbox database is ATTACHed to the canonical writer connection so
//! `apply_transaction` covers every table in one store-local transaction:
//! it either fully succeeds (nodes, edges, acl, mailbox items,
//! applied_events, checkpoint) or aborts with no side effect.
//!
//! The store is mutated only by its owning applier worker; readers open
//! their own short-lived connections and get snapshot isolation from
//! SQLite's WAL mode.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    now_ms, ActorId, IdempotencyKey, NodeId, Principal, TenantId, TransactionEvent,
};
use crate::error::Transience;
use crate::schema::SchemaRegistry;
use crate::wal::WalPosition;

pub mod canonical;
pub mod mailbox;

pub use canonical::{EdgeRow, NodeHead, NodeRow};
pub use mailbox::{MailboxItemRow, SearchHit, SnippetExtractors};

const BUSY_TIMEOUT_MS: u64 = 5_000;
const CACHE_SIZE_KB: i64 = -16_000;

pub const CANONICAL_DB: &str = "canonical.db";
pub const MAILBOX_DB: &str = "mailbox.db";

const META_CHECKPOINT: &str = "checkpoint";
const META_SCHEMA_FINGERPRINT: &str = "schema_fingerprint";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("store data corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("invariant violation: {reason}")]
    InvariantViolation { reason: String },
    #[error("node {node_id} not found")]
    NotFound { node_id: NodeId },
    #[error("actor {actor} may not read node {node_id}")]
    Forbidden { actor: ActorId, node_id: NodeId },
    #[error(transparent)]
    InvalidId(#[from] crate::core::InvalidId),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Sqlite(_) | StoreError::Io { .. } => Transience::Retryable,
            StoreError::Symlink { .. }
            | StoreError::Corrupt { .. }
            | StoreError::InvariantViolation { .. }
            | StoreError::NotFound { .. }
            | StoreError::Forbidden { .. }
            | StoreError::InvalidId(_) => Transience::Permanent,
        }
    }
}

/// Caller identity for the read surface. Visibility: owner, or any of
/// the caller's principals present in the node's acl, or `tenant:*`.
#[derive(Clone, Debug)]
pub struct ReadAccess {
    pub actor: ActorId,
    pub principals: Vec<Principal>,
}

impl ReadAccess {
    pub fn new(actor: ActorId) -> Self {
        // An actor string like `user:42` doubles as its own principal.
        let principals = Principal::parse(actor.as_str()).ok().into_iter().collect();
        Self { actor, principals }
    }

    pub fn with_principals(actor: ActorId, principals: Vec<Principal>) -> Self {
        Self { actor, principals }
    }
}

/// One optimistic-concurrency (or missing-node) conflict inside a
/// transaction. The transaction's mutations are rolled back; the marker
/// is what both waiters and idempotent retries observe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub op_index: usize,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_version: Option<i64>,
    pub reason: String,
}

/// Durable result of applying one event, stored in
/// `applied_events.result_json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_nodes: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictInfo>,
}

impl ApplyResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Outcome of `apply_transaction`.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    /// Applied by this call.
    Applied(ApplyResult),
    /// Idempotency key already present; nothing changed. Carries the
    /// stored result and the position recorded at first apply.
    AlreadyApplied {
        result: ApplyResult,
        position: Option<WalPosition>,
    },
}

/// Opens and caches per-tenant store handles.
pub struct TenantStores {
    data_dir: PathBuf,
    stores: Mutex<HashMap<TenantId, Arc<TenantStore>>>,
}

impl TenantStores {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.data_dir.join(tenant.as_str())
    }

    /// Open (creating on first use) the tenant's stores.
    pub fn acquire(&self, tenant: &TenantId) -> Result<Arc<TenantStore>, StoreError> {
        let mut stores = self.stores.lock().expect("tenant stores lock");
        if let Some(store) = stores.get(tenant) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(TenantStore::open(self.tenant_dir(tenant), tenant.clone())?);
        stores.insert(tenant.clone(), Arc::clone(&store));
        Ok(store)
    }

    /// Whether the tenant's store directory exists on disk.
    pub fn exists(&self, tenant: &TenantId) -> bool {
        self.tenant_dir(tenant).join(CANONICAL_DB).exists()
    }

    /// Drop a cached handle (used by recovery before replacing files).
    pub fn evict(&self, tenant: &TenantId) {
        let mut stores = self.stores.lock().expect("tenant stores lock");
        stores.remove(tenant);
    }

    /// Tenants present on disk, by directory scan.
    pub fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let mut tenants = Vec::new();
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tenants),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.data_dir.clone(),
                    source: e,
                })
            }
        };
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.data_dir.clone(),
                source: e,
            })?;
            if !entry.path().join(CANONICAL_DB).exists() {
                continue;
            }
            if let Ok(tenant) = TenantId::parse(entry.file_name().to_string_lossy().to_string()) {
                tenants.push(tenant);
            }
        }
        tenants.sort();
        Ok(tenants)
    }
}

/// A single tenant's pair of databases behind one writer connection.
pub struct TenantStore {
    tenant: TenantId,
    dir: PathBuf,
    canonical_path: PathBuf,
    mailbox_path: PathBuf,
    writer: Mutex<Connection>,
}

impl TenantStore {
    pub fn open(dir: PathBuf, tenant: TenantId) -> Result<Self, StoreError> {
        reject_symlink(&dir)?;
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })?;
        let canonical_path = dir.join(CANONICAL_DB);
        let mailbox_path = dir.join(MAILBOX_DB);
        reject_symlink(&canonical_path)?;
        reject_symlink(&mailbox_path)?;

        // Mailbox schema first on its own connection, then the writer
        // attaches it for transactional fanout.
        let mb = open_connection(&mailbox_path, false)?;
        mailbox::initialize_schema(&mb)?;
        drop(mb);

        let conn = open_connection(&canonical_path, false)?;
        canonical::initialize_schema(&conn)?;
        attach_mailbox(&conn, &mailbox_path)?;

        ensure_permissions(&canonical_path)?;
        ensure_permissions(&mailbox_path)?;

        Ok(Self {
            tenant,
            dir,
            canonical_path,
            mailbox_path,
            writer: Mutex::new(conn),
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical_path
    }

    pub fn mailbox_path(&self) -> &Path {
        &self.mailbox_path
    }

    fn open_read(&self) -> Result<Connection, StoreError> {
        let conn = open_connection(&self.canonical_path, true)?;
        attach_mailbox(&conn, &self.mailbox_path)?;
        Ok(conn)
    }

    /// Apply one event in a single transaction, or skip it if the
    /// idempotency key is already recorded (the replay-safe path).
    ///
    /// Conflicts do not fail the call: the operation mutations roll back
    /// and the conflict marker commits in `applied_events` alongside the
    /// advanced checkpoint.
    pub fn apply_transaction(
        &self,
        registry: &SchemaRegistry,
        snippets: &SnippetExtractors,
        event: &TransactionEvent,
        position: WalPosition,
    ) -> Result<ApplyOutcome, StoreError> {
        let conn = self.writer.lock().expect("store writer lock");
        let txn = WriteTxn::begin(&conn)?;

        if let Some((stored_position, result)) = lookup_applied(&conn, &event.idempotency_key)? {
            txn.rollback()?;
            return Ok(ApplyOutcome::AlreadyApplied {
                result,
                position: stored_position,
            });
        }

        conn.execute_batch("SAVEPOINT ops")?;
        let applied = canonical::apply_operations(&conn, registry, snippets, event);
        let result = match applied {
            Ok(result) => {
                conn.execute_batch("RELEASE ops")?;
                result
            }
            Err(ApplyAbort::Conflict(result)) => {
                // Atomicity: one conflicting op voids the whole group.
                conn.execute_batch("ROLLBACK TO ops; RELEASE ops")?;
                result
            }
            Err(ApplyAbort::Error(err)) => {
                txn.rollback()?;
                return Err(err);
            }
        };

        let result_json = serde_json::to_string(&result).map_err(|e| StoreError::Corrupt {
            reason: format!("result encode failed: {e}"),
        })?;
        conn.execute(
            "INSERT INTO applied_events (idempotency_key, wal_position, result_json, applied_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.idempotency_key.as_str(),
                position.to_string(),
                result_json,
                now_ms(),
            ],
        )?;
        set_meta(&conn, META_CHECKPOINT, &encode_position(position))?;
        txn.commit()?;

        tracing::debug!(
            tenant = %self.tenant,
            key = %event.idempotency_key,
            position = %position,
            conflicts = result.conflicts.len(),
            "applied transaction"
        );
        Ok(ApplyOutcome::Applied(result))
    }

    /// The applier's authoritative checkpoint, from `tenant_meta`.
    pub fn checkpoint(&self) -> Result<Option<WalPosition>, StoreError> {
        let conn = self.writer.lock().expect("store writer lock");
        let raw = get_meta(&conn, META_CHECKPOINT)?;
        raw.map(|raw| decode_position(&raw)).transpose()
    }

    /// Stored result for an idempotency key, if the event applied.
    pub fn applied_result(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<(Option<WalPosition>, ApplyResult)>, StoreError> {
        let conn = self.open_read()?;
        lookup_applied(&conn, key)
    }

    pub fn schema_fingerprint(&self) -> Result<Option<String>, StoreError> {
        let conn = self.open_read()?;
        get_meta(&conn, META_SCHEMA_FINGERPRINT)
    }

    pub fn set_schema_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        let conn = self.writer.lock().expect("store writer lock");
        set_meta(&conn, META_SCHEMA_FINGERPRINT, fingerprint)?;
        Ok(())
    }

    /// Unchecked head lookup used by coordinator preflight. Not part of
    /// the ACL-gated read surface.
    pub fn node_head(&self, node_id: &NodeId) -> Result<Option<NodeHead>, StoreError> {
        let conn = self.open_read()?;
        canonical::load_node_head(&conn, node_id)
    }

    // Read surface. Each call takes its own snapshot.

    pub fn get_node(
        &self,
        access: &ReadAccess,
        node_id: &NodeId,
        include_deleted: bool,
    ) -> Result<NodeRow, StoreError> {
        let conn = self.open_read()?;
        canonical::get_node(&conn, access, node_id, include_deleted)
    }

    pub fn query_nodes(
        &self,
        access: &ReadAccess,
        type_id: u32,
        filters: &crate::core::Payload,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NodeRow>, StoreError> {
        let conn = self.open_read()?;
        canonical::query_nodes(&conn, access, type_id, filters, limit, offset)
    }

    pub fn edges_out(
        &self,
        node_id: &NodeId,
        edge_type_id: Option<u32>,
    ) -> Result<Vec<EdgeRow>, StoreError> {
        let conn = self.open_read()?;
        canonical::edges(&conn, node_id, edge_type_id, canonical::EdgeDir::Out)
    }

    pub fn edges_in(
        &self,
        node_id: &NodeId,
        edge_type_id: Option<u32>,
    ) -> Result<Vec<EdgeRow>, StoreError> {
        let conn = self.open_read()?;
        canonical::edges(&conn, node_id, edge_type_id, canonical::EdgeDir::In)
    }

    pub fn mailbox(
        &self,
        user: &Principal,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MailboxItemRow>, StoreError> {
        let conn = self.open_read()?;
        mailbox::list_items(&conn, user, limit, offset)
    }

    pub fn search_mailbox(
        &self,
        user: &Principal,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let conn = self.open_read()?;
        mailbox::search(&conn, user, query, limit)
    }

    pub fn update_mailbox_state(
        &self,
        user: &Principal,
        item_id: &str,
        state_patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<MailboxItemRow>, StoreError> {
        let conn = self.writer.lock().expect("store writer lock");
        mailbox::update_state(&conn, user, item_id, state_patch)
    }

    /// Row counts for health/admin surfaces.
    pub fn stats(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let conn = self.open_read()?;
        let mut stats = BTreeMap::new();
        for (name, sql) in [
            ("nodes", "SELECT COUNT(*) FROM nodes WHERE deleted = 0"),
            ("edges", "SELECT COUNT(*) FROM edges"),
            ("applied_events", "SELECT COUNT(*) FROM applied_events"),
            ("mailbox_items", "SELECT COUNT(*) FROM mb.items"),
        ] {
            let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            stats.insert(name.to_string(), count);
        }
        Ok(stats)
    }
}

/// Internal abort channel for `apply_operations`.
pub(crate) enum ApplyAbort {
    /// Conflict: mutations void, marker commits.
    Conflict(ApplyResult),
    /// Hard failure: whole transaction aborts.
    Error(StoreError),
}

impl From<StoreError> for ApplyAbort {
    fn from(err: StoreError) -> Self {
        ApplyAbort::Error(err)
    }
}

impl From<rusqlite::Error> for ApplyAbort {
    fn from(err: rusqlite::Error) -> Self {
        ApplyAbort::Error(StoreError::Sqlite(err))
    }
}

fn lookup_applied(
    conn: &Connection,
    key: &IdempotencyKey,
) -> Result<Option<(Option<WalPosition>, ApplyResult)>, StoreError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT wal_position, result_json FROM applied_events WHERE idempotency_key = ?1",
            params![key.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((position, result_json)) => {
            let result =
                serde_json::from_str(&result_json).map_err(|e| StoreError::Corrupt {
                    reason: format!("stored result decode failed: {e}"),
                })?;
            let position = parse_position(&position);
            Ok(Some((position, result)))
        }
    }
}

fn parse_position(raw: &str) -> Option<WalPosition> {
    let (partition, offset) = raw.split_once(':')?;
    Some(WalPosition::new(
        partition.parse().ok()?,
        offset.parse().ok()?,
    ))
}

fn encode_position(position: WalPosition) -> String {
    position.to_string()
}

fn decode_position(raw: &str) -> Result<WalPosition, StoreError> {
    parse_position(raw).ok_or_else(|| StoreError::Corrupt {
        reason: format!("bad checkpoint {raw:?}"),
    })
}

pub(crate) fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT v FROM tenant_meta WHERE k = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tenant_meta (k, v) VALUES (?1, ?2) \
         ON CONFLICT(k) DO UPDATE SET v = excluded.v",
        params![key, value],
    )?;
    Ok(())
}

/// BEGIN IMMEDIATE guard: rolls back on drop unless committed.
struct WriteTxn<'a> {
    conn: &'a Connection,
    done: bool,
}

impl<'a> WriteTxn<'a> {
    fn begin(conn: &'a Connection) -> Result<Self, StoreError> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self { conn, done: false })
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn open_connection(path: &Path, read_only: bool) -> Result<Connection, StoreError> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
    };
    let conn = Connection::open_with_flags(path, flags)?;
    if !read_only {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
    }
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KB)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

fn attach_mailbox(conn: &Connection, mailbox_path: &Path) -> Result<(), StoreError> {
    conn.execute(
        "ATTACH DATABASE ?1 AS mb",
        params![mailbox_path.to_string_lossy()],
    )?;
    Ok(())
}

fn ensure_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
                StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        }
    }
    Ok(())
}

fn reject_symlink(path: &Path) -> Result<(), StoreError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(StoreError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}
