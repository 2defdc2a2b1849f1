//! Recovery: rebuild a tenant from (snapshot, archive, live WAL).
//!
//! The procedure: pick the newest manifest at or before the target,
//! verify checksums, restore the database files into a fresh store
//! directory, gate on the schema fingerprint, then drive the normal
//! apply path over the archive tail and finally the live WAL. Replay
//! goes through `apply_transaction`, so `applied_events` makes it safe
//! to overlap the archive and the live stream.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::apply::AppliedTracker;
use crate::archive::{self, ArchiveError};
use crate::core::{sha256_bytes, TenantId};
use crate::error::Transience;
use crate::objstore::{ObjectStore, ObjectStoreError};
use crate::schema::{RegistryError, SchemaRegistry};
use crate::snapshot::{manifest_at_or_before, latest_manifest, Manifest, SnapshotError};
use crate::store::{SnippetExtractors, StoreError, TenantStores};
use crate::wal::{StartPos, Wal, WalError, WalPosition};

const LIVE_DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("snapshot file {name} failed checksum: expected {expected}, got {got}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        got: String,
    },
    #[error("snapshot file {name} missing from object store")]
    FileMissing { name: String },
    #[error("snapshot fingerprint {snapshot} does not match live registry {live}; refusing to mount")]
    FingerprintMismatch { snapshot: String, live: String },
    #[error("gzip failed: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecoveryError {
    pub fn transience(&self) -> Transience {
        match self {
            RecoveryError::Store(e) => e.transience(),
            RecoveryError::Snapshot(e) => e.transience(),
            RecoveryError::Archive(e) => e.transience(),
            RecoveryError::Wal(e) => e.transience(),
            RecoveryError::ObjectStore(e) => e.transience(),
            RecoveryError::Gzip(_) | RecoveryError::Io { .. } => Transience::Retryable,
            RecoveryError::Registry(_)
            | RecoveryError::ChecksumMismatch { .. }
            | RecoveryError::FileMissing { .. }
            | RecoveryError::FingerprintMismatch { .. } => Transience::Permanent,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RestoreReport {
    pub tenant_id: TenantId,
    pub snapshot_position: Option<WalPosition>,
    pub archive_replayed: u64,
    pub live_replayed: u64,
    pub final_position: Option<WalPosition>,
}

pub struct RestoreTool {
    stores: Arc<TenantStores>,
    objects: Arc<dyn ObjectStore>,
    wal: Arc<dyn Wal>,
    registry: Arc<SchemaRegistry>,
    snippets: Arc<SnippetExtractors>,
    snapshot_prefix: String,
    archive_prefix: String,
}

impl RestoreTool {
    pub fn new(
        stores: Arc<TenantStores>,
        objects: Arc<dyn ObjectStore>,
        wal: Arc<dyn Wal>,
        registry: Arc<SchemaRegistry>,
        snippets: Arc<SnippetExtractors>,
        snapshot_prefix: impl Into<String>,
        archive_prefix: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            objects,
            wal,
            registry,
            snippets,
            snapshot_prefix: snapshot_prefix.into(),
            archive_prefix: archive_prefix.into(),
        }
    }

    /// Restore one tenant into the data directory, replacing whatever is
    /// there. The tenant's applier must not be running. `target` bounds
    /// the replay; `None` recovers everything available.
    pub fn restore_tenant(
        &self,
        tenant: &TenantId,
        target: Option<WalPosition>,
        tracker: Option<&AppliedTracker>,
    ) -> Result<RestoreReport, RecoveryError> {
        let manifest = match target {
            Some(target) => manifest_at_or_before(
                self.objects.as_ref(),
                &self.snapshot_prefix,
                tenant,
                target,
            )?,
            None => latest_manifest(self.objects.as_ref(), &self.snapshot_prefix, tenant)?,
        };

        // Fresh store directory: drop the handle, clear the files.
        self.stores.evict(tenant);
        let dir = self.stores.tenant_dir(tenant);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|source| RecoveryError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        std::fs::create_dir_all(&dir).map_err(|source| RecoveryError::Io {
            path: dir.clone(),
            source,
        })?;

        let snapshot_position = match &manifest {
            Some(manifest) => {
                self.restore_snapshot_files(tenant, manifest, &dir)?;
                Some(manifest.wal_position)
            }
            None => None,
        };

        let store = self.stores.acquire(tenant)?;
        // Read back the applied position the snapshot carried; trust the
        // store, not the manifest, as the resume point.
        let resume = store.checkpoint()?;
        if let Some(manifest) = &manifest {
            self.check_fingerprint(manifest)?;
            if resume != Some(manifest.wal_position) {
                tracing::warn!(
                    tenant = %tenant,
                    manifest = %manifest.wal_position,
                    store = ?resume,
                    "restored checkpoint differs from manifest position"
                );
            }
        }

        let partition = self.wal.partition_for_key(tenant);
        let mut last_applied = resume;
        let mut archive_replayed = 0u64;

        // Archive tail first.
        let after = last_applied.map(|p| p.offset);
        for line in archive::replay(
            self.objects.as_ref(),
            &self.archive_prefix,
            partition,
            after,
        )? {
            if line.event.tenant_id != *tenant {
                continue;
            }
            if let Some(target) = target {
                if line.position.offset > target.offset {
                    break;
                }
            }
            store.apply_transaction(&self.registry, &self.snippets, &line.event, line.position)?;
            last_applied = Some(line.position);
            archive_replayed += 1;
        }

        // Switch to the live WAL once the archive runs dry.
        let start = match last_applied {
            Some(position) => StartPos::After(position),
            None => StartPos::Earliest,
        };
        let mut live_replayed = 0u64;
        let mut consumer = self.wal.open_consumer(partition, "entdb-restore", start)?;
        loop {
            if let (Some(target), Some(applied)) = (target, last_applied) {
                if applied.offset >= target.offset {
                    break;
                }
            }
            let Some(record) = consumer.next_timeout(LIVE_DRAIN_POLL)? else {
                break;
            };
            if record.key != tenant.as_str() {
                continue;
            }
            if let Some(target) = target {
                if record.position.offset > target.offset {
                    break;
                }
            }
            let event = match crate::core::decode_envelope(&record.value) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(
                        tenant = %tenant,
                        position = %record.position,
                        error = %err,
                        "skipping undecodable record during restore"
                    );
                    continue;
                }
            };
            store.apply_transaction(&self.registry, &self.snippets, &event, record.position)?;
            last_applied = Some(record.position);
            live_replayed += 1;
        }

        if let (Some(tracker), Some(position)) = (tracker, last_applied) {
            tracker.publish(tenant, position);
        }

        let report = RestoreReport {
            tenant_id: tenant.clone(),
            snapshot_position,
            archive_replayed,
            live_replayed,
            final_position: last_applied,
        };
        tracing::info!(
            tenant = %tenant,
            snapshot = ?report.snapshot_position,
            archive = report.archive_replayed,
            live = report.live_replayed,
            final_position = ?report.final_position,
            "tenant restored"
        );
        Ok(report)
    }

    fn restore_snapshot_files(
        &self,
        tenant: &TenantId,
        manifest: &Manifest,
        dir: &std::path::Path,
    ) -> Result<(), RecoveryError> {
        for file in &manifest.file_list {
            let key = format!(
                "{}/{}/{:020}/{}",
                self.snapshot_prefix, tenant, manifest.wal_position.offset, file.name
            );
            let compressed =
                self.objects
                    .get(&key)?
                    .ok_or_else(|| RecoveryError::FileMissing {
                        name: file.name.clone(),
                    })?;
            let got = sha256_bytes(&compressed).to_hex();
            if got != file.sha256 {
                return Err(RecoveryError::ChecksumMismatch {
                    name: file.name.clone(),
                    expected: file.sha256.clone(),
                    got,
                });
            }

            let mut decoder = GzDecoder::new(compressed.as_slice());
            let mut raw = Vec::new();
            decoder.read_to_end(&mut raw).map_err(RecoveryError::Gzip)?;

            let plain_name = file.name.strip_suffix(".gz").unwrap_or(&file.name);
            let path = dir.join(plain_name);
            std::fs::write(&path, raw).map_err(|source| RecoveryError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn check_fingerprint(&self, manifest: &Manifest) -> Result<(), RecoveryError> {
        let Some(snapshot_fp) = &manifest.schema_fingerprint else {
            return Ok(());
        };
        let live = self.registry.fingerprint()?.to_string();
        if snapshot_fp != &live {
            return Err(RecoveryError::FingerprintMismatch {
                snapshot: snapshot_fp.clone(),
                live,
            });
        }
        Ok(())
    }
}
