//! Mailbox store: per-recipient derived items with full-text search.
//!
//! Items are produced as a side effect of `create_node` operations that
//! name recipients. The FTS5 index is an external-content mirror of
//! `items.snippet`, kept in sync by triggers so the applier never
//! touches it directly.
//!
//! When accessed through the tenant's canonical connection the database
//! is attached as `mb`; the schema itself is created over a direct
//! connection, so trigger bodies use unqualified names.

use rusqlite::{Connection, OptionalExtension, params};

use crate::core::{sha256_bytes, NodeId, Payload, Principal, TransactionEvent, Value};
use crate::schema::NodeTypeDef;

use super::{ApplyAbort, StoreError};

const SNIPPET_MAX_LEN: usize = 1_000;

pub(crate) fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS items (
           item_id TEXT PRIMARY KEY,
           recipient_user_id TEXT NOT NULL,
           ref_id TEXT NOT NULL,
           source_type_id INTEGER NOT NULL,
           source_node_id TEXT NOT NULL,
           thread_id TEXT,
           ts INTEGER NOT NULL,
           state_json TEXT NOT NULL DEFAULT '{}',
           snippet TEXT NOT NULL DEFAULT ''
         );
         CREATE INDEX IF NOT EXISTS items_by_recipient ON items (recipient_user_id, ts DESC);
         CREATE INDEX IF NOT EXISTS items_by_source ON items (source_node_id);
         CREATE VIRTUAL TABLE IF NOT EXISTS items_fts USING fts5(
           snippet,
           content='items',
           content_rowid='rowid'
         );
         CREATE TRIGGER IF NOT EXISTS items_fts_ai AFTER INSERT ON items BEGIN
           INSERT INTO items_fts(rowid, snippet) VALUES (new.rowid, new.snippet);
         END;
         CREATE TRIGGER IF NOT EXISTS items_fts_ad AFTER DELETE ON items BEGIN
           INSERT INTO items_fts(items_fts, rowid, snippet)
           VALUES('delete', old.rowid, old.snippet);
         END;
         CREATE TRIGGER IF NOT EXISTS items_fts_au AFTER UPDATE ON items BEGIN
           INSERT INTO items_fts(items_fts, rowid, snippet)
           VALUES('delete', old.rowid, old.snippet);
           INSERT INTO items_fts(rowid, snippet) VALUES (new.rowid, new.snippet);
         END;",
    )?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct MailboxItemRow {
    pub item_id: String,
    pub recipient_user_id: String,
    pub ref_id: String,
    pub source_type_id: u32,
    pub source_node_id: NodeId,
    pub thread_id: Option<String>,
    pub ts: i64,
    pub state: serde_json::Map<String, serde_json::Value>,
    pub snippet: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub item: MailboxItemRow,
    pub rank: f64,
}

type ExtractorFn = dyn Fn(&Payload) -> String + Send + Sync;

/// Per-type snippet extractors. The default walks the type's searchable
/// fields, falling back to the first string field of the payload.
pub struct SnippetExtractors {
    by_type: std::collections::HashMap<u32, Box<ExtractorFn>>,
}

impl SnippetExtractors {
    pub fn new() -> Self {
        Self {
            by_type: std::collections::HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, type_id: u32, extractor: F)
    where
        F: Fn(&Payload) -> String + Send + Sync + 'static,
    {
        self.by_type.insert(type_id, Box::new(extractor));
    }

    pub fn extract(&self, node_type: Option<&NodeTypeDef>, payload: &Payload) -> String {
        let raw = match node_type.and_then(|t| self.by_type.get(&t.type_id)) {
            Some(extractor) => extractor(payload),
            None => default_snippet(node_type, payload),
        };
        truncate_snippet(raw)
    }
}

impl Default for SnippetExtractors {
    fn default() -> Self {
        Self::new()
    }
}

fn default_snippet(node_type: Option<&NodeTypeDef>, payload: &Payload) -> String {
    if let Some(node_type) = node_type {
        let parts: Vec<&str> = node_type
            .searchable_fields()
            .filter_map(|f| payload.get(&f.name).and_then(Value::as_str))
            .collect();
        if !parts.is_empty() {
            return parts.join(" ");
        }
    }
    // Best effort: first string field in name order.
    payload
        .values()
        .find_map(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn truncate_snippet(mut raw: String) -> String {
    if raw.len() > SNIPPET_MAX_LEN {
        let mut cut = SNIPPET_MAX_LEN;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        raw.truncate(cut);
    }
    raw
}

/// Deterministic item id so replays are idempotent by construction.
pub(crate) fn fanout_item_id(
    event: &TransactionEvent,
    op_index: usize,
    recipient: &Principal,
) -> String {
    let seed = format!("{}/{op_index}/{recipient}", event.event_id);
    sha256_bytes(seed.as_bytes()).to_hex()[..32].to_string()
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_fanout_item(
    conn: &Connection,
    snippets: &SnippetExtractors,
    event: &TransactionEvent,
    op_index: usize,
    recipient: &Principal,
    node_id: &NodeId,
    node_type: Option<&NodeTypeDef>,
    payload: &Payload,
) -> Result<(), ApplyAbort> {
    let item_id = fanout_item_id(event, op_index, recipient);
    let snippet = snippets.extract(node_type, payload);
    let thread_id = payload.get("thread_id").and_then(Value::as_str);
    let state = serde_json::json!({ "read": false }).to_string();
    conn.execute(
        "INSERT OR IGNORE INTO mb.items \
         (item_id, recipient_user_id, ref_id, source_type_id, source_node_id, \
          thread_id, ts, state_json, snippet) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            item_id,
            recipient.to_string(),
            node_id.as_str(),
            node_type.map(|t| t.type_id),
            node_id.as_str(),
            thread_id,
            event.created_at_ms,
            state,
            snippet,
        ],
    )
    .map_err(StoreError::Sqlite)?;
    Ok(())
}

pub(crate) fn list_items(
    conn: &Connection,
    user: &Principal,
    limit: usize,
    offset: usize,
) -> Result<Vec<MailboxItemRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT item_id, recipient_user_id, ref_id, source_type_id, source_node_id, \
                thread_id, ts, state_json, snippet \
         FROM mb.items WHERE recipient_user_id = ?1 \
         ORDER BY ts DESC, item_id ASC LIMIT ?2 OFFSET ?3",
    )?;
    let mut rows = stmt.query(params![user.to_string(), limit as i64, offset as i64])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode_item(row)?);
    }
    Ok(out)
}

/// Full-text search over a user's snippets, best match first. The query
/// is tokenized and quoted so raw user input cannot break the FTS
/// grammar.
pub(crate) fn search(
    conn: &Connection,
    user: &Principal,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, StoreError> {
    let fts_query = quote_fts_query(query);
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT i.item_id, i.recipient_user_id, i.ref_id, i.source_type_id, i.source_node_id, \
                i.thread_id, i.ts, i.state_json, i.snippet, f.rank \
         FROM mb.items_fts(?1) f JOIN mb.items i ON i.rowid = f.rowid \
         WHERE i.recipient_user_id = ?2 \
         ORDER BY f.rank ASC LIMIT ?3",
    )?;
    let mut rows = stmt.query(params![fts_query, user.to_string(), limit as i64])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let rank: f64 = row.get(9)?;
        out.push(SearchHit {
            item: decode_item(row)?,
            rank,
        });
    }
    Ok(out)
}

pub(crate) fn update_state(
    conn: &Connection,
    user: &Principal,
    item_id: &str,
    state_patch: &serde_json::Map<String, serde_json::Value>,
) -> Result<Option<MailboxItemRow>, StoreError> {
    let current: Option<String> = conn
        .query_row(
            "SELECT state_json FROM mb.items WHERE item_id = ?1 AND recipient_user_id = ?2",
            params![item_id, user.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(current) = current else {
        return Ok(None);
    };

    let mut state: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&current).map_err(|e| StoreError::Corrupt {
            reason: format!("state decode failed: {e}"),
        })?;
    for (key, value) in state_patch {
        state.insert(key.clone(), value.clone());
    }
    let encoded = serde_json::Value::Object(state).to_string();
    conn.execute(
        "UPDATE mb.items SET state_json = ?1 WHERE item_id = ?2 AND recipient_user_id = ?3",
        params![encoded, item_id, user.to_string()],
    )?;

    let mut stmt = conn.prepare(
        "SELECT item_id, recipient_user_id, ref_id, source_type_id, source_node_id, \
                thread_id, ts, state_json, snippet \
         FROM mb.items WHERE item_id = ?1",
    )?;
    let mut rows = stmt.query(params![item_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_item(row)?)),
        None => Ok(None),
    }
}

fn decode_item(row: &rusqlite::Row<'_>) -> Result<MailboxItemRow, StoreError> {
    let source_node_id: String = row.get(4)?;
    let state_json: String = row.get(7)?;
    let state = serde_json::from_str(&state_json).map_err(|e| StoreError::Corrupt {
        reason: format!("state decode failed: {e}"),
    })?;
    Ok(MailboxItemRow {
        item_id: row.get(0)?,
        recipient_user_id: row.get(1)?,
        ref_id: row.get(2)?,
        source_type_id: row.get(3)?,
        source_node_id: NodeId::parse(source_node_id)?,
        thread_id: row.get(5)?,
        ts: row.get(6)?,
        state,
        snippet: row.get(8)?,
    })
}

fn quote_fts_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|token| {
            let cleaned = token.replace('"', "");
            format!("\"{cleaned}\"")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActorId, EventId, IdempotencyKey, SchemaFingerprint, TenantId};
    use crate::schema::{FieldDef, FieldKind};

    fn event() -> TransactionEvent {
        TransactionEvent {
            event_id: EventId::new(),
            tenant_id: TenantId::parse("t1").unwrap(),
            actor: ActorId::parse("user:a").unwrap(),
            idempotency_key: IdempotencyKey::parse("k").unwrap(),
            schema_fingerprint: SchemaFingerprint(sha256_bytes(b"s")),
            created_at_ms: 1,
            operations: vec![],
        }
    }

    #[test]
    fn fanout_item_id_is_deterministic_per_recipient() {
        let event = event();
        let alice = Principal::parse("user:alice").unwrap();
        let bob = Principal::parse("user:bob").unwrap();
        assert_eq!(
            fanout_item_id(&event, 0, &alice),
            fanout_item_id(&event, 0, &alice)
        );
        assert_ne!(
            fanout_item_id(&event, 0, &alice),
            fanout_item_id(&event, 0, &bob)
        );
        assert_ne!(
            fanout_item_id(&event, 0, &alice),
            fanout_item_id(&event, 1, &alice)
        );
    }

    #[test]
    fn default_snippet_prefers_searchable_fields() {
        let ty = NodeTypeDef::new(
            1,
            "Task",
            vec![
                FieldDef::new(1, "title", FieldKind::String).searchable(),
                FieldDef::new(2, "note", FieldKind::String),
            ],
        );
        let mut payload = Payload::new();
        payload.insert("note".into(), Value::Str("ignore me".into()));
        payload.insert("title".into(), Value::Str("fix the pump".into()));

        let snippets = SnippetExtractors::new();
        assert_eq!(snippets.extract(Some(&ty), &payload), "fix the pump");
    }

    #[test]
    fn default_snippet_falls_back_to_first_string() {
        let snippets = SnippetExtractors::new();
        let mut payload = Payload::new();
        payload.insert("count".into(), Value::Int(2));
        payload.insert("note".into(), Value::Str("hello".into()));
        assert_eq!(snippets.extract(None, &payload), "hello");
    }

    #[test]
    fn registered_extractor_wins() {
        let ty = NodeTypeDef::new(7, "Msg", vec![]);
        let mut snippets = SnippetExtractors::new();
        snippets.register(7, |_| "custom".to_string());
        assert_eq!(snippets.extract(Some(&ty), &Payload::new()), "custom");
    }

    #[test]
    fn fts_query_is_quoted() {
        assert_eq!(quote_fts_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(quote_fts_query("a\"b OR x"), "\"ab\" \"OR\" \"x\"");
        assert_eq!(quote_fts_query("  "), "");
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let long = "é".repeat(900);
        let out = truncate_snippet(long);
        assert!(out.len() <= SNIPPET_MAX_LEN);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
