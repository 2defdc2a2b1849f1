//! Dead-letter sidecar: events the applier could not apply.
//!
//! One JSONL file per tenant (plus `_undecodable.jsonl` for records that
//! never yielded a tenant). The stream never blocks on a poisoned
//! event: the entry is written, the checkpoint advances, operators
//! review the file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{now_ms, TransactionEvent};
use crate::wal::WalPosition;

use super::ApplyError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub at_ms: i64,
    pub partition: u32,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<TransactionEvent>,
}

pub struct DeadLetter {
    dir: PathBuf,
}

impl DeadLetter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record(
        &self,
        position: WalPosition,
        event: Option<&TransactionEvent>,
        reason: &str,
    ) -> Result<(), ApplyError> {
        let entry = DeadLetterEntry {
            at_ms: now_ms(),
            partition: position.partition,
            offset: position.offset,
            tenant_id: event.map(|e| e.tenant_id.to_string()),
            idempotency_key: event.map(|e| e.idempotency_key.to_string()),
            reason: reason.to_string(),
            event: event.cloned(),
        };
        let file_name = match &entry.tenant_id {
            Some(tenant) => format!("{tenant}.jsonl"),
            None => "_undecodable.jsonl".to_string(),
        };

        fs::create_dir_all(&self.dir).map_err(|source| ApplyError::DeadLetterIo {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(file_name);
        let mut line = serde_json::to_vec(&entry).map_err(|e| ApplyError::DeadLetterEncode {
            reason: e.to_string(),
        })?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ApplyError::DeadLetterIo {
                path: path.clone(),
                source,
            })?;
        file.write_all(&line)
            .map_err(|source| ApplyError::DeadLetterIo { path, source })?;

        tracing::error!(
            partition = position.partition,
            offset = position.offset,
            tenant = entry.tenant_id.as_deref().unwrap_or("?"),
            reason,
            "event routed to dead-letter"
        );
        Ok(())
    }

    /// Entries for one tenant, oldest first.
    pub fn entries_for(&self, tenant: &str) -> Result<Vec<DeadLetterEntry>, ApplyError> {
        let path = self.dir.join(format!("{tenant}.jsonl"));
        let body = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ApplyError::DeadLetterIo { path, source }),
        };
        let mut entries = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let entry =
                serde_json::from_str(line).map_err(|e| ApplyError::DeadLetterEncode {
                    reason: format!("dead-letter line decode failed: {e}"),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_and_read_back() {
        let dir = TempDir::new().unwrap();
        let dl = DeadLetter::new(dir.path());
        dl.record(WalPosition::new(0, 3), None, "undecodable").unwrap();

        let entries = dl.entries_for("_undecodable").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, 3);
        assert_eq!(entries[0].reason, "undecodable");
        assert!(entries[0].event.is_none());

        assert!(dl.entries_for("t1").unwrap().is_empty());
    }
}
