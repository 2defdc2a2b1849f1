//! Composition root: builds the WAL, stores, registry and workers, and
//! exposes the coordinator plus the read surface to the transport layer
//! (gRPC/HTTP handlers live outside this crate and call into here).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::apply::{Applier, ApplierConfig, AppliedTracker, DeadLetter};
use crate::archive::{Archiver, ArchiverConfig};
use crate::config::{AckPolicy, Config, WalBackendKind};
use crate::coord::{Coordinator, CoordError, ExecuteRequest, Receipt};
use crate::core::{NodeId, Payload, Principal, TenantId};
use crate::objstore::{FsObjectStore, ObjectStore};
use crate::schema::{SchemaDoc, SchemaRegistry};
use crate::snapshot::{Snapshotter, SnapshotterConfig};
use crate::store::{
    MailboxItemRow, NodeRow, ReadAccess, SearchHit, SnippetExtractors, StoreError, TenantStores,
};
use crate::store::EdgeRow;
use crate::wal::{DiskWal, MemoryWal, Wal, WalPosition};
use crate::wal::log::DiskWalConfig;

const MAX_QUERY_LIMIT: usize = 1_000;

pub struct Server;

impl Server {
    /// Bring the whole pipeline up. The registry freezes here if the
    /// caller has not frozen it already.
    pub fn start(
        config: Config,
        mut registry: SchemaRegistry,
        snippets: SnippetExtractors,
    ) -> crate::Result<ServerHandle> {
        let fingerprint = registry.freeze()?;
        let registry = Arc::new(registry);
        tracing::info!(%fingerprint, "starting entdb");

        let wal: Arc<dyn Wal> = match config.wal.backend {
            WalBackendKind::Log => Arc::new(DiskWal::open(
                config.wal_dir(),
                DiskWalConfig {
                    partitions: config.wal.partitions,
                    max_record_bytes: config.wal.max_record_bytes,
                    segment_max_bytes: config.wal.segment_max_bytes,
                    sync_on_append: config.wal.acks == AckPolicy::All,
                },
            )?),
            WalBackendKind::Memory => Arc::new(MemoryWal::new(
                config.wal.partitions,
                config.wal.max_record_bytes,
            )),
        };

        let stores = Arc::new(TenantStores::new(config.store_data_dir()));
        check_tenant_fingerprints(&stores, &fingerprint.to_string());

        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.objstore_root()));
        let tracker = Arc::new(AppliedTracker::new());

        let mut applier_config = ApplierConfig::new(config.deadletter_dir());
        applier_config.max_retry_backoff = Duration::from_millis(config.apply.max_retry_backoff_ms);
        applier_config.poll_interval = Duration::from_millis(config.apply.poll_interval_ms);
        let applier = Arc::new(Applier::new(
            Arc::clone(&wal),
            Arc::clone(&stores),
            Arc::clone(&registry),
            Arc::new(snippets),
            Arc::clone(&tracker),
            applier_config,
        ));
        applier.recover_applied_positions()?;

        let archiver = Arc::new(Archiver::new(
            Arc::clone(&wal),
            Arc::clone(&objects),
            ArchiverConfig {
                object_prefix: config.archive.object_prefix.clone(),
                segment_max_bytes: config.archive.segment_bytes,
                segment_max_age: Duration::from_secs(config.archive.segment_seconds),
                poll_interval: Duration::from_millis(200),
            },
        ));
        let snapshotter = Arc::new(Snapshotter::new(
            Arc::clone(&stores),
            Arc::clone(&objects),
            SnapshotterConfig {
                object_prefix: config.snapshot.object_prefix.clone(),
                interval: Duration::from_secs(config.snapshot.interval_hours * 3600),
                retention: Duration::from_secs(config.snapshot.retention_days * 24 * 3600),
            },
        ));

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&wal),
            Arc::clone(&stores),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            config.default_deadline(),
        ));

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = applier.start(Arc::clone(&shutdown));
        workers.extend(archiver.start(Arc::clone(&shutdown)));
        workers.push(snapshotter.start(Arc::clone(&shutdown)));

        Ok(ServerHandle {
            registry,
            stores,
            wal,
            coordinator,
            tracker,
            applier,
            shutdown,
            workers,
        })
    }
}

/// A running server: coordinator, read surface, health, shutdown.
pub struct ServerHandle {
    registry: Arc<SchemaRegistry>,
    stores: Arc<TenantStores>,
    wal: Arc<dyn Wal>,
    coordinator: Arc<Coordinator>,
    tracker: Arc<AppliedTracker>,
    applier: Arc<Applier>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn execute(&self, request: ExecuteRequest) -> Result<Receipt, CoordError> {
        self.coordinator.execute(request)
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &TenantStores {
        &self.stores
    }

    pub fn wal(&self) -> &Arc<dyn Wal> {
        &self.wal
    }

    pub fn tracker(&self) -> &AppliedTracker {
        &self.tracker
    }

    pub fn deadletter(&self) -> &DeadLetter {
        self.applier.deadletter()
    }

    // Read surface. Eventually consistent with respect to WAL
    // acknowledgment unless the write used wait_for_applied.

    pub fn get_node(
        &self,
        tenant: &TenantId,
        access: &ReadAccess,
        node_id: &NodeId,
        include_deleted: bool,
    ) -> Result<NodeRow, StoreError> {
        self.stores
            .acquire(tenant)?
            .get_node(access, node_id, include_deleted)
    }

    pub fn query_nodes(
        &self,
        tenant: &TenantId,
        access: &ReadAccess,
        type_id: u32,
        filters: &Payload,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NodeRow>, StoreError> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        self.stores
            .acquire(tenant)?
            .query_nodes(access, type_id, filters, limit, offset)
    }

    pub fn edges_out(
        &self,
        tenant: &TenantId,
        node_id: &NodeId,
        edge_type_id: Option<u32>,
    ) -> Result<Vec<EdgeRow>, StoreError> {
        self.stores.acquire(tenant)?.edges_out(node_id, edge_type_id)
    }

    pub fn edges_in(
        &self,
        tenant: &TenantId,
        node_id: &NodeId,
        edge_type_id: Option<u32>,
    ) -> Result<Vec<EdgeRow>, StoreError> {
        self.stores.acquire(tenant)?.edges_in(node_id, edge_type_id)
    }

    pub fn mailbox(
        &self,
        tenant: &TenantId,
        user: &Principal,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MailboxItemRow>, StoreError> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        self.stores.acquire(tenant)?.mailbox(user, limit, offset)
    }

    pub fn search(
        &self,
        tenant: &TenantId,
        user: &Principal,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        self.stores.acquire(tenant)?.search_mailbox(user, query, limit)
    }

    pub fn get_schema(&self) -> SchemaDoc {
        self.registry.to_doc()
    }

    pub fn health(&self) -> HealthReport {
        let tenants = self
            .stores
            .list_tenants()
            .unwrap_or_default()
            .into_iter()
            .map(|tenant| {
                let applied = self.tracker.get(&tenant);
                TenantHealth { tenant, applied }
            })
            .collect();
        let partitions = (0..self.wal.partitions())
            .map(|partition| PartitionHealth {
                partition,
                latest: self.wal.latest_position(partition).ok().flatten(),
            })
            .collect();
        HealthReport {
            status: "ok",
            tenants,
            partitions,
        }
    }

    /// Drain workers and shut down.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("entdb stopped");
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub tenants: Vec<TenantHealth>,
    pub partitions: Vec<PartitionHealth>,
}

#[derive(Debug, Serialize)]
pub struct TenantHealth {
    pub tenant: TenantId,
    pub applied: Option<WalPosition>,
}

#[derive(Debug, Serialize)]
pub struct PartitionHealth {
    pub partition: u32,
    pub latest: Option<WalPosition>,
}

/// Startup check: warn when a tenant last applied under a different
/// schema fingerprint. Evolution is gated by the compatibility check in
/// CI, so a mismatch here is informational, not fatal.
fn check_tenant_fingerprints(stores: &TenantStores, live: &str) {
    let tenants = match stores.list_tenants() {
        Ok(tenants) => tenants,
        Err(err) => {
            tracing::warn!(error = %err, "could not scan tenants for fingerprint check");
            return;
        }
    };
    for tenant in tenants {
        let stored = stores
            .acquire(&tenant)
            .and_then(|store| store.schema_fingerprint());
        match stored {
            Ok(Some(stored)) if stored != live => {
                tracing::warn!(
                    tenant = %tenant,
                    stored = %stored,
                    live = %live,
                    "tenant last applied under a different schema fingerprint"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(tenant = %tenant, error = %err, "fingerprint check failed");
            }
        }
    }
}
