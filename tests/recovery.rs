//! Snapshot, archive and recovery properties: a tenant rebuilt from
//! (snapshot + archive + live WAL) matches the live store, and the
//! archive replays the same event bytes the live WAL serves.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use entdb::apply::{Applier, ApplierConfig, AppliedTracker};
use entdb::archive::{self, Archiver, ArchiverConfig};
use entdb::core::encode_event_body;
use entdb::coord::{Coordinator, ExecuteRequest};
use entdb::objstore::{FsObjectStore, ObjectStore};
use entdb::recovery::{RecoveryError, RestoreTool};
use entdb::schema::{FieldDef, FieldKind, NodeTypeDef, SchemaRegistry};
use entdb::snapshot::{Snapshotter, SnapshotterConfig};
use entdb::store::TenantStores;
use entdb::wal::log::DiskWalConfig;
use entdb::wal::{DiskWal, StartPos, Wal};
use entdb::core::sha256_bytes;
use entdb::{
    ActorId, IdempotencyKey, Operation, Payload, Principal, ReadAccess, SnippetExtractors,
    TenantId, Value, WalPosition,
};

fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register_node_type(NodeTypeDef::new(
            1,
            "Note",
            vec![
                FieldDef::new(1, "title", FieldKind::String).required().searchable(),
                FieldDef::new(2, "seq", FieldKind::Int64),
            ],
        ))
        .unwrap();
    registry
}

struct Stack {
    dir: TempDir,
    wal: Arc<DiskWal>,
    stores: Arc<TenantStores>,
    registry: Arc<SchemaRegistry>,
    tracker: Arc<AppliedTracker>,
    coordinator: Coordinator,
    objects: Arc<FsObjectStore>,
    snapshotter: Snapshotter,
    shutdown: Arc<AtomicBool>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Stack {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut registry = registry();
        registry.freeze().unwrap();
        let registry = Arc::new(registry);

        let wal = Arc::new(
            DiskWal::open(
                dir.path().join("wal"),
                DiskWalConfig {
                    partitions: 2,
                    max_record_bytes: 1024 * 1024,
                    segment_max_bytes: 4 * 1024,
                    sync_on_append: true,
                },
            )
            .unwrap(),
        );
        let stores = Arc::new(TenantStores::new(dir.path().join("tenants")));
        let objects = Arc::new(FsObjectStore::new(dir.path().join("objects")));
        let tracker = Arc::new(AppliedTracker::new());

        let wal_dyn: Arc<dyn Wal> = wal.clone();
        let coordinator = Coordinator::new(
            Arc::clone(&wal_dyn),
            Arc::clone(&stores),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Duration::from_secs(5),
        );
        let snapshotter = Snapshotter::new(
            Arc::clone(&stores),
            objects.clone() as Arc<dyn ObjectStore>,
            SnapshotterConfig {
                object_prefix: "snapshots".into(),
                interval: Duration::from_secs(3600),
                retention: Duration::from_secs(3600 * 24),
            },
        );

        Stack {
            dir,
            wal,
            stores,
            registry,
            tracker,
            coordinator,
            objects,
            snapshotter,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    fn start_workers(&mut self) {
        self.shutdown = Arc::new(AtomicBool::new(false));
        let wal_dyn: Arc<dyn Wal> = self.wal.clone();
        let mut apply_config = ApplierConfig::new(self.dir.path().join("deadletter"));
        apply_config.poll_interval = Duration::from_millis(10);
        let applier = Arc::new(Applier::new(
            Arc::clone(&wal_dyn),
            Arc::clone(&self.stores),
            Arc::clone(&self.registry),
            Arc::new(SnippetExtractors::new()),
            Arc::clone(&self.tracker),
            apply_config,
        ));
        applier.recover_applied_positions().unwrap();
        self.workers = applier.start(Arc::clone(&self.shutdown));

        let archiver = Arc::new(Archiver::new(
            Arc::clone(&wal_dyn),
            self.objects.clone() as Arc<dyn ObjectStore>,
            ArchiverConfig {
                object_prefix: "archive".into(),
                segment_max_bytes: 2 * 1024,
                segment_max_age: Duration::from_millis(50),
                poll_interval: Duration::from_millis(10),
            },
        ));
        self.workers.extend(archiver.start(Arc::clone(&self.shutdown)));
    }

    /// Stop workers; the archiver flushes its pending segment on the way
    /// out.
    fn stop_workers(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            handle.join().unwrap();
        }
    }

    fn restore_tool(&self) -> RestoreTool {
        RestoreTool::new(
            Arc::clone(&self.stores),
            self.objects.clone() as Arc<dyn ObjectStore>,
            self.wal.clone() as Arc<dyn Wal>,
            Arc::clone(&self.registry),
            Arc::new(SnippetExtractors::new()),
            "snapshots",
            "archive",
        )
    }
}

fn actor() -> ActorId {
    ActorId::parse("user:writer").unwrap()
}

fn note_ops(i: usize) -> Vec<Operation> {
    let mut payload = Payload::new();
    payload.insert("title".into(), Value::Str(format!("note {i}")));
    payload.insert("seq".into(), Value::Int(i as i64));
    vec![Operation::CreateNode {
        type_id: 1,
        payload,
        node_id: None,
        alias: Some("n".into()),
        principals: vec![Principal::TenantWildcard],
        recipients: vec![],
    }]
}

fn write_notes(stack: &Stack, tenant: &TenantId, range: std::ops::Range<usize>) -> WalPosition {
    let mut last = WalPosition::new(0, 0);
    for i in range {
        let receipt = stack
            .coordinator
            .execute(ExecuteRequest {
                tenant_id: tenant.clone(),
                actor: actor(),
                idempotency_key: Some(
                    IdempotencyKey::parse(format!("{tenant}-note-{i}")).unwrap(),
                ),
                schema_fingerprint: None,
                operations: note_ops(i),
                wait_for_applied: true,
                deadline: Some(Duration::from_secs(10)),
            })
            .unwrap();
        assert!(receipt.applied, "apply lagged for {tenant} note {i}");
        last = receipt.wal_position;
    }
    last
}

/// Logical dump used to compare a live store against its rebuild.
fn dump_tenant(stack: &Stack, tenant: &TenantId) -> (BTreeMap<String, i64>, Vec<(String, i64)>) {
    let store = stack.stores.acquire(tenant).unwrap();
    let stats = store.stats().unwrap();
    let access = ReadAccess::new(actor());
    let mut nodes: Vec<(String, i64)> = store
        .query_nodes(&access, 1, &Payload::new(), 1000, 0)
        .unwrap()
        .into_iter()
        .map(|n| (n.id.to_string(), n.version))
        .collect();
    nodes.sort();
    (stats, nodes)
}

#[test]
fn s5_destroy_and_restore_three_tenants() {
    let mut stack = Stack::new();
    stack.start_workers();

    let tenants: Vec<TenantId> = ["t1", "t2", "t3"]
        .iter()
        .map(|t| TenantId::parse(*t).unwrap())
        .collect();

    // Phase one, then snapshot every tenant.
    for tenant in &tenants {
        write_notes(&stack, tenant, 0..8);
    }
    for tenant in &tenants {
        stack
            .snapshotter
            .snapshot_tenant(tenant)
            .unwrap()
            .expect("snapshot written");
    }

    // Phase two: more traffic past the snapshots.
    for tenant in &tenants {
        write_notes(&stack, tenant, 8..20);
    }
    stack.stop_workers();

    let before: Vec<_> = tenants.iter().map(|t| dump_tenant(&stack, t)).collect();
    let checkpoints: Vec<_> = tenants
        .iter()
        .map(|t| stack.stores.acquire(t).unwrap().checkpoint().unwrap())
        .collect();

    // Destroy all derived state.
    for tenant in &tenants {
        stack.stores.evict(tenant);
        std::fs::remove_dir_all(stack.dir.path().join("tenants").join(tenant.as_str())).unwrap();
    }

    // Rebuild from snapshot + archive + live WAL.
    let tool = stack.restore_tool();
    for (i, tenant) in tenants.iter().enumerate() {
        let report = tool.restore_tenant(tenant, None, Some(&stack.tracker)).unwrap();
        assert!(report.snapshot_position.is_some(), "snapshot unused for {tenant}");
        assert_eq!(report.final_position, checkpoints[i]);
    }

    let after: Vec<_> = tenants.iter().map(|t| dump_tenant(&stack, t)).collect();
    assert_eq!(before, after);
}

#[test]
fn s6_archive_replay_matches_live_wal_bytes() {
    let mut stack = Stack::new();
    stack.start_workers();

    let tenant = TenantId::parse("t1").unwrap();
    write_notes(&stack, &tenant, 0..12);
    stack.stop_workers();

    let partition = stack.wal.partition_for_key(&tenant);

    // Archive side: concatenated canonical event bytes in offset order.
    let archived = archive::replay(&*stack.objects, "archive", partition, None).unwrap();
    assert!(!archived.is_empty());
    let mut archive_bytes = Vec::new();
    let mut archive_offsets = Vec::new();
    for line in &archived {
        if line.event.tenant_id != tenant {
            continue;
        }
        archive_bytes.extend_from_slice(&encode_event_body(&line.event).unwrap());
        archive_offsets.push(line.position.offset);
    }

    // Live side: fresh consume over the same positions.
    let mut live_bytes = Vec::new();
    let mut live_offsets = Vec::new();
    let mut consumer = stack
        .wal
        .open_consumer(partition, "verify", StartPos::Earliest)
        .unwrap();
    while let Some(record) = consumer.next_timeout(Duration::from_millis(50)).unwrap() {
        if record.key != tenant.as_str() {
            continue;
        }
        let event = entdb::core::decode_envelope(&record.value).unwrap();
        live_bytes.extend_from_slice(&encode_event_body(&event).unwrap());
        live_offsets.push(record.position.offset);
    }

    assert_eq!(archive_offsets, live_offsets);
    assert_eq!(
        sha256_bytes(&archive_bytes).to_hex(),
        sha256_bytes(&live_bytes).to_hex()
    );

    // Checksum sidecars verify, and every segment has one.
    let segments = archive::list_segments(&*stack.objects, "archive", partition).unwrap();
    assert!(!segments.is_empty());
    for segment in &segments {
        archive::read_segment(&*stack.objects, segment).unwrap();
    }
}

#[test]
fn restore_refuses_on_fingerprint_mismatch() {
    let mut stack = Stack::new();
    stack.start_workers();

    let tenant = TenantId::parse("t1").unwrap();
    write_notes(&stack, &tenant, 0..4);
    stack.snapshotter.snapshot_tenant(&tenant).unwrap().unwrap();
    stack.stop_workers();

    // A different live schema: same shape plus one more type.
    let mut other = registry();
    other
        .register_node_type(NodeTypeDef::new(9, "Extra", vec![]))
        .unwrap();
    other.freeze().unwrap();

    let tool = RestoreTool::new(
        Arc::clone(&stack.stores),
        stack.objects.clone() as Arc<dyn ObjectStore>,
        stack.wal.clone() as Arc<dyn Wal>,
        Arc::new(other),
        Arc::new(SnippetExtractors::new()),
        "snapshots",
        "archive",
    );
    let err = tool.restore_tenant(&tenant, None, None).unwrap_err();
    assert!(matches!(err, RecoveryError::FingerprintMismatch { .. }));
}

#[test]
fn snapshot_concurrent_with_heavy_apply_is_usable() {
    let mut stack = Stack::new();
    stack.start_workers();
    let tenant = TenantId::parse("t1").unwrap();

    // Writer thread hammers while the snapshot runs.
    write_notes(&stack, &tenant, 0..4);
    let writer = {
        let coordinator_wal: Arc<dyn Wal> = stack.wal.clone();
        let coordinator = Coordinator::new(
            coordinator_wal,
            Arc::clone(&stack.stores),
            Arc::clone(&stack.registry),
            Arc::clone(&stack.tracker),
            Duration::from_secs(5),
        );
        let tenant = tenant.clone();
        std::thread::spawn(move || {
            for i in 100..140 {
                coordinator
                    .execute(ExecuteRequest {
                        tenant_id: tenant.clone(),
                        actor: actor(),
                        idempotency_key: Some(
                            IdempotencyKey::parse(format!("hot-{i}")).unwrap(),
                        ),
                        schema_fingerprint: None,
                        operations: note_ops(i),
                        wait_for_applied: false,
                        deadline: None,
                    })
                    .unwrap();
            }
        })
    };

    let manifest = stack.snapshotter.snapshot_tenant(&tenant).unwrap().unwrap();
    writer.join().unwrap();

    // Wait for everything to land, then restore from that mid-traffic
    // snapshot; replay must converge to the live state.
    let latest = stack.wal.latest_position(stack.wal.partition_for_key(&tenant)).unwrap().unwrap();
    assert!(stack.tracker.wait_for(&tenant, latest, Duration::from_secs(10)));
    stack.stop_workers();

    let before = dump_tenant(&stack, &tenant);
    for t in stack.stores.list_tenants().unwrap() {
        stack.stores.evict(&t);
    }
    std::fs::remove_dir_all(stack.dir.path().join("tenants").join(tenant.as_str())).unwrap();

    let tool = stack.restore_tool();
    let report = tool.restore_tenant(&tenant, None, None).unwrap();
    assert_eq!(report.snapshot_position, Some(manifest.wal_position));
    let after = dump_tenant(&stack, &tenant);
    assert_eq!(before, after);
}
