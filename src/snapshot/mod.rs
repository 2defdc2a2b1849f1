//! Snapshotter: periodic consistent backups of tenant stores.
//!
//! Per tenant: read the applied position from `tenant_meta`, take an
//! online SQLite backup of both databases, gzip, upload the files under
//! `snapshots/<tenant>/<offset>/`, then write `manifest.json` last -
//! readers treat the absence of a manifest as the absence of the
//! snapshot. Snapshot failures raise health signals but never fail
//! writes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::backup::Backup;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::io::Write;
use thiserror::Error;

use crate::core::{now_ms, sha256_bytes, TenantId};
use crate::error::Transience;
use crate::objstore::{ObjectStore, ObjectStoreError};
use crate::store::{StoreError, TenantStores, CANONICAL_DB, MAILBOX_DB};
use crate::wal::WalPosition;

const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 512;
const BACKUP_PAUSE: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error("sqlite backup failed: {0}")]
    Backup(#[from] rusqlite::Error),
    #[error("gzip failed: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("manifest encode/decode failed: {0}")]
    Manifest(String),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    pub fn transience(&self) -> Transience {
        match self {
            SnapshotError::Store(e) => e.transience(),
            SnapshotError::ObjectStore(e) => e.transience(),
            SnapshotError::Backup(_) | SnapshotError::Gzip(_) | SnapshotError::Io { .. } => {
                Transience::Retryable
            }
            SnapshotError::Manifest(_) => Transience::Permanent,
        }
    }
}

/// One uploaded snapshot file: gzip bytes named `<name>.gz`, checksum of
/// the uploaded (compressed) bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Written last; its presence is what makes the snapshot exist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub tenant_id: TenantId,
    pub wal_position: WalPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_fingerprint: Option<String>,
    pub created_at_ms: i64,
    pub file_list: Vec<ManifestFile>,
}

#[derive(Clone, Debug)]
pub struct SnapshotterConfig {
    pub object_prefix: String,
    pub interval: Duration,
    pub retention: Duration,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            object_prefix: "snapshots".to_string(),
            interval: Duration::from_secs(6 * 3600),
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

pub struct Snapshotter {
    stores: Arc<TenantStores>,
    store: Arc<dyn ObjectStore>,
    config: SnapshotterConfig,
}

impl Snapshotter {
    pub fn new(
        stores: Arc<TenantStores>,
        store: Arc<dyn ObjectStore>,
        config: SnapshotterConfig,
    ) -> Self {
        Self {
            stores,
            store,
            config,
        }
    }

    /// Single scheduler thread; tenants snapshot sequentially, which is
    /// also the global concurrency bound.
    pub fn start(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let snapshotter = Arc::clone(self);
        std::thread::Builder::new()
            .name("snapshotter".to_string())
            .spawn(move || snapshotter.run(&shutdown))
            .expect("spawn snapshotter")
    }

    fn run(&self, shutdown: &AtomicBool) {
        tracing::info!(interval_s = self.config.interval.as_secs(), "snapshotter started");
        let tick = Duration::from_millis(250);
        let mut next_cycle = std::time::Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            if std::time::Instant::now() < next_cycle {
                std::thread::sleep(tick);
                continue;
            }
            next_cycle = std::time::Instant::now() + self.config.interval;
            if let Err(err) = self.cycle() {
                tracing::error!(error = %err, "snapshot cycle failed");
            }
        }
        tracing::info!("snapshotter stopped");
    }

    /// One pass over every tenant on disk.
    pub fn cycle(&self) -> Result<(), SnapshotError> {
        for tenant in self.stores.list_tenants()? {
            match self.snapshot_tenant(&tenant) {
                Ok(Some(manifest)) => {
                    tracing::info!(
                        tenant = %tenant,
                        position = %manifest.wal_position,
                        files = manifest.file_list.len(),
                        "snapshot complete"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    // Keep going; one tenant's failure is its own.
                    tracing::error!(tenant = %tenant, error = %err, "snapshot failed");
                }
            }
            if let Err(err) = self.apply_retention(&tenant) {
                tracing::warn!(tenant = %tenant, error = %err, "snapshot retention failed");
            }
        }
        Ok(())
    }

    /// Snapshot one tenant. Skips when nothing applied yet or when the
    /// latest snapshot already covers the current applied position.
    pub fn snapshot_tenant(&self, tenant: &TenantId) -> Result<Option<Manifest>, SnapshotError> {
        let store = self.stores.acquire(tenant)?;
        let Some(position) = store.checkpoint()? else {
            return Ok(None);
        };
        if let Some(latest) = latest_manifest(self.store.as_ref(), &self.config.object_prefix, tenant)? {
            if latest.wal_position.offset >= position.offset {
                return Ok(None);
            }
        }

        // Scratch space beside the store; removed when the upload ends.
        let scratch = store.dir().join(".snapshot-tmp");
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch).map_err(|source| SnapshotError::Io {
                path: scratch.clone(),
                source,
            })?;
        }
        std::fs::create_dir_all(&scratch).map_err(|source| SnapshotError::Io {
            path: scratch.clone(),
            source,
        })?;
        let _cleanup = ScratchGuard(&scratch);

        let mut files = Vec::new();
        for (name, src) in [
            (CANONICAL_DB, store.canonical_path()),
            (MAILBOX_DB, store.mailbox_path()),
        ] {
            let backup_path = scratch.join(name);
            backup_database(src, &backup_path)?;
            let raw = std::fs::read(&backup_path).map_err(|source| SnapshotError::Io {
                path: backup_path.clone(),
                source,
            })?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw).map_err(SnapshotError::Gzip)?;
            let compressed = encoder.finish().map_err(SnapshotError::Gzip)?;

            let object_name = format!("{name}.gz");
            let key = snapshot_key(&self.config.object_prefix, tenant, position, &object_name);
            self.store.put(&key, &compressed)?;
            files.push(ManifestFile {
                name: object_name,
                bytes: compressed.len() as u64,
                sha256: sha256_bytes(&compressed).to_hex(),
            });
        }

        let manifest = Manifest {
            tenant_id: tenant.clone(),
            wal_position: position,
            schema_fingerprint: store.schema_fingerprint()?,
            created_at_ms: now_ms(),
            file_list: files,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| SnapshotError::Manifest(e.to_string()))?;
        // Manifest last: its arrival commits the snapshot.
        let key = snapshot_key(&self.config.object_prefix, tenant, position, "manifest.json");
        self.store.put(&key, &manifest_bytes)?;

        Ok(Some(manifest))
    }

    fn apply_retention(&self, tenant: &TenantId) -> Result<(), SnapshotError> {
        let manifests =
            list_manifests(self.store.as_ref(), &self.config.object_prefix, tenant)?;
        if manifests.len() <= 1 {
            return Ok(());
        }
        let cutoff = now_ms() - self.config.retention.as_millis() as i64;
        // Never delete the newest snapshot, whatever its age.
        for (manifest, _) in &manifests[..manifests.len() - 1] {
            if manifest.created_at_ms >= cutoff {
                continue;
            }
            let prefix = format!(
                "{}/{}/{:020}",
                self.config.object_prefix,
                tenant,
                manifest.wal_position.offset
            );
            for key in self.store.list(&prefix)? {
                self.store.delete(&key)?;
            }
            tracing::info!(tenant = %tenant, position = %manifest.wal_position, "expired snapshot removed");
        }
        Ok(())
    }
}

struct ScratchGuard<'a>(&'a Path);

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(self.0);
    }
}

fn snapshot_key(
    prefix: &str,
    tenant: &TenantId,
    position: WalPosition,
    name: &str,
) -> String {
    format!("{prefix}/{tenant}/{:020}/{name}", position.offset)
}

fn backup_database(src: &Path, dst: &Path) -> Result<(), SnapshotError> {
    let src = Connection::open_with_flags(
        src,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    let mut dst = Connection::open(dst)?;
    let backup = Backup::new(&src, &mut dst)?;
    backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)?;
    Ok(())
}

/// All manifests for a tenant, ascending by wal position.
pub fn list_manifests(
    store: &dyn ObjectStore,
    prefix: &str,
    tenant: &TenantId,
) -> Result<Vec<(Manifest, String)>, SnapshotError> {
    let scope = format!("{prefix}/{tenant}");
    let mut manifests = Vec::new();
    for key in store.list(&scope)? {
        if !key.ends_with("/manifest.json") {
            continue;
        }
        let Some(bytes) = store.get(&key)? else {
            continue;
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| SnapshotError::Manifest(format!("{key}: {e}")))?;
        manifests.push((manifest, key));
    }
    manifests.sort_by_key(|(m, _)| m.wal_position.offset);
    Ok(manifests)
}

/// Newest manifest, if any snapshot is complete.
pub fn latest_manifest(
    store: &dyn ObjectStore,
    prefix: &str,
    tenant: &TenantId,
) -> Result<Option<Manifest>, SnapshotError> {
    Ok(list_manifests(store, prefix, tenant)?
        .into_iter()
        .last()
        .map(|(manifest, _)| manifest))
}

/// Newest manifest at or before `target`.
pub fn manifest_at_or_before(
    store: &dyn ObjectStore,
    prefix: &str,
    tenant: &TenantId,
    target: WalPosition,
) -> Result<Option<Manifest>, SnapshotError> {
    Ok(list_manifests(store, prefix, tenant)?
        .into_iter()
        .filter(|(m, _)| m.wal_position.offset <= target.offset)
        .last()
        .map(|(manifest, _)| manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_key_zero_pads_offset() {
        let tenant = TenantId::parse("t1").unwrap();
        assert_eq!(
            snapshot_key("snapshots", &tenant, WalPosition::new(0, 42), "manifest.json"),
            "snapshots/t1/00000000000000000042/manifest.json"
        );
    }
}
