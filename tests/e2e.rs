//! End-to-end scenarios over the full write-and-apply pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tempfile::TempDir;

use entdb::apply::{Applier, ApplierConfig, AppliedTracker};
use entdb::config::{Config, WalBackendKind};
use entdb::coord::{CoordError, Coordinator, ExecuteRequest};
use entdb::core::{AliasRef, NodeRef};
use entdb::schema::{EdgeTypeDef, FieldDef, FieldKind, NodeTypeDef, SchemaRegistry};
use entdb::store::TenantStores;
use entdb::wal::{MemoryWal, Wal};
use entdb::{
    ActorId, ErrorCode, IdempotencyKey, NodeId, Operation, Payload, Principal, ReadAccess, Server,
    SnippetExtractors, TenantId, Value,
};

fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register_node_type(NodeTypeDef::new(
            1,
            "User",
            vec![
                FieldDef::new(1, "email", FieldKind::String).required(),
                FieldDef::new(2, "name", FieldKind::String).searchable(),
            ],
        ))
        .unwrap();
    registry
        .register_node_type(NodeTypeDef::new(
            2,
            "Task",
            vec![
                FieldDef::new(1, "title", FieldKind::String)
                    .required()
                    .searchable(),
                FieldDef::new(2, "status", FieldKind::Enum)
                    .with_enum_values(["todo", "doing", "done"])
                    .with_default(Value::Enum("todo".into())),
            ],
        ))
        .unwrap();
    registry
        .register_edge_type(EdgeTypeDef::new(100, "AssignedTo", 2, 1))
        .unwrap();
    registry
}

/// Manually assembled pipeline so tests control exactly when the applier
/// runs.
struct Stack {
    _dir: TempDir,
    wal: Arc<MemoryWal>,
    stores: Arc<TenantStores>,
    registry: Arc<SchemaRegistry>,
    tracker: Arc<AppliedTracker>,
    coordinator: Coordinator,
    deadletter_dir: std::path::PathBuf,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Stack {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut registry = registry();
        registry.freeze().unwrap();
        let registry = Arc::new(registry);

        let wal = Arc::new(MemoryWal::new(2, 1024 * 1024));
        let stores = Arc::new(TenantStores::new(dir.path().join("tenants")));
        let tracker = Arc::new(AppliedTracker::new());
        let deadletter_dir = dir.path().join("deadletter");

        let wal_dyn: Arc<dyn Wal> = wal.clone();
        let coordinator = Coordinator::new(
            Arc::clone(&wal_dyn),
            Arc::clone(&stores),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Duration::from_secs(5),
        );

        Stack {
            _dir: dir,
            wal,
            stores,
            registry,
            tracker,
            coordinator,
            deadletter_dir,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    fn start_applier(&mut self) {
        let wal_dyn: Arc<dyn Wal> = self.wal.clone();
        let mut config = ApplierConfig::new(&self.deadletter_dir);
        config.poll_interval = Duration::from_millis(10);
        let applier = Arc::new(Applier::new(
            wal_dyn,
            Arc::clone(&self.stores),
            Arc::clone(&self.registry),
            Arc::new(SnippetExtractors::new()),
            Arc::clone(&self.tracker),
            config,
        ));
        applier.recover_applied_positions().unwrap();
        self.shutdown = Arc::new(AtomicBool::new(false));
        self.workers = applier.start(Arc::clone(&self.shutdown));
    }

    fn stop_applier(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            handle.join().unwrap();
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.stop_applier();
    }
}

fn tenant() -> TenantId {
    TenantId::parse("t1").unwrap()
}

fn alice() -> ActorId {
    ActorId::parse("user:alice").unwrap()
}

fn s1_operations() -> Vec<Operation> {
    let mut user = Payload::new();
    user.insert("email".into(), Value::Str("a@x".into()));
    user.insert("name".into(), Value::Str("Alice".into()));
    let mut task = Payload::new();
    task.insert("title".into(), Value::Str("T1".into()));
    task.insert("status".into(), Value::Enum("todo".into()));
    vec![
        Operation::CreateNode {
            type_id: 1,
            payload: user,
            node_id: None,
            alias: Some("u".into()),
            principals: vec![Principal::TenantWildcard],
            recipients: vec![],
        },
        Operation::CreateNode {
            type_id: 2,
            payload: task,
            node_id: None,
            alias: Some("t".into()),
            principals: vec![Principal::TenantWildcard],
            recipients: vec![],
        },
        Operation::CreateEdge {
            edge_type_id: 100,
            from: NodeRef::Alias(AliasRef::parse("$t.id").unwrap()),
            to: NodeRef::Alias(AliasRef::parse("$u.id").unwrap()),
            props: Payload::new(),
        },
    ]
}

fn request(key: &str, operations: Vec<Operation>, wait: bool) -> ExecuteRequest {
    ExecuteRequest {
        tenant_id: tenant(),
        actor: alice(),
        idempotency_key: Some(IdempotencyKey::parse(key).unwrap()),
        schema_fingerprint: None,
        operations,
        wait_for_applied: wait,
        deadline: Some(Duration::from_secs(5)),
    }
}

#[test]
fn s1_create_user_task_and_edge_atomically() {
    let mut stack = Stack::new();
    stack.start_applier();

    let receipt = stack
        .coordinator
        .execute(request("e2e-1", s1_operations(), true))
        .unwrap();
    assert!(receipt.applied);
    assert!(receipt.conflicts.is_empty());
    let id_u = receipt.result_aliases.get("u").unwrap().clone();
    let id_t = receipt.result_aliases.get("t").unwrap().clone();
    assert_ne!(id_u, id_t);

    let store = stack.stores.acquire(&tenant()).unwrap();
    let access = ReadAccess::new(alice());
    let user = store.get_node(&access, &id_u, false).unwrap();
    assert_eq!(user.payload.get("email"), Some(&Value::Str("a@x".into())));

    let incoming = store.edges_in(&id_u, Some(100)).unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].from_id, id_t);
    assert_eq!(incoming[0].to_id, id_u);
}

#[test]
fn s2_retry_with_same_key_returns_same_receipt_and_no_new_effects() {
    let mut stack = Stack::new();
    stack.start_applier();

    let first = stack
        .coordinator
        .execute(request("e2e-2", s1_operations(), true))
        .unwrap();

    let partition = first.wal_position.partition;
    let latest_before = stack.wal.latest_position(partition).unwrap();

    let retry = stack
        .coordinator
        .execute(request("e2e-2", s1_operations(), true))
        .unwrap();

    assert_eq!(retry.wal_position, first.wal_position);
    assert_eq!(retry.result_aliases, first.result_aliases);
    assert_eq!(retry.created_nodes, first.created_nodes);

    // Zero additional appends, zero additional rows.
    assert_eq!(stack.wal.latest_position(partition).unwrap(), latest_before);
    let stats = stack.stores.acquire(&tenant()).unwrap().stats().unwrap();
    assert_eq!(stats["nodes"], 2);
    assert_eq!(stats["applied_events"], 1);
}

#[test]
fn s3_optimistic_concurrency_yields_exactly_one_conflict() {
    let mut stack = Stack::new();
    stack.start_applier();

    let receipt = stack
        .coordinator
        .execute(request("setup", s1_operations(), true))
        .unwrap();
    let id_u = receipt.result_aliases.get("u").unwrap().clone();

    // Pause the applier so both updates preflight against version 1,
    // like two racing coordinators.
    stack.stop_applier();

    let update = |name: &str| {
        let mut patch = Payload::new();
        patch.insert("name".into(), Value::Str(name.into()));
        vec![Operation::UpdateNode {
            node: NodeRef::Id(id_u.clone()),
            patch,
            expected_version: Some(1),
        }]
    };
    let first = stack
        .coordinator
        .execute(request("upd-1", update("Alice2"), false))
        .unwrap();
    let second = stack
        .coordinator
        .execute(request("upd-2", update("Alice3"), false))
        .unwrap();
    assert!(second.wal_position.offset > first.wal_position.offset);

    stack.start_applier();
    assert!(stack
        .tracker
        .wait_for(&tenant(), second.wal_position, Duration::from_secs(5)));

    let store = stack.stores.acquire(&tenant()).unwrap();
    let (_, win) = store
        .applied_result(&IdempotencyKey::parse("upd-1").unwrap())
        .unwrap()
        .unwrap();
    let (_, lose) = store
        .applied_result(&IdempotencyKey::parse("upd-2").unwrap())
        .unwrap()
        .unwrap();
    assert!(win.conflicts.is_empty());
    assert_eq!(lose.conflicts.len(), 1);
    assert_eq!(lose.conflicts[0].observed_version, Some(2));

    // The losing write left no trace.
    let access = ReadAccess::new(alice());
    let user = store.get_node(&access, &id_u, false).unwrap();
    assert_eq!(user.version, 2);
    assert_eq!(user.payload.get("name"), Some(&Value::Str("Alice2".into())));
}

#[test]
fn s4_validation_error_suggests_field_and_appends_nothing() {
    let stack = Stack::new();

    let mut payload = Payload::new();
    payload.insert("emial".into(), Value::Str("a@x".into()));
    let err = stack
        .coordinator
        .execute(request(
            "bad-1",
            vec![Operation::CreateNode {
                type_id: 1,
                payload,
                node_id: None,
                alias: None,
                principals: vec![],
                recipients: vec![],
            }],
            false,
        ))
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ValidationError);
    let CoordError::Validation { errors } = err else {
        panic!("expected validation error");
    };
    let unknown = errors[0]
        .errors
        .iter()
        .find(|e| e.field == "emial")
        .expect("emial error");
    assert_eq!(unknown.suggestions, vec!["email".to_string()]);

    // No WAL append happened.
    for partition in 0..stack.wal.partitions() {
        assert_eq!(stack.wal.latest_position(partition).unwrap(), None);
    }
}

#[test]
fn idempotency_key_reuse_with_different_body_is_rejected() {
    let mut stack = Stack::new();
    stack.start_applier();

    stack
        .coordinator
        .execute(request("reuse-1", s1_operations(), true))
        .unwrap();

    let mut other = Payload::new();
    other.insert("email".into(), Value::Str("b@x".into()));
    let err = stack
        .coordinator
        .execute(request(
            "reuse-1",
            vec![Operation::CreateNode {
                type_id: 1,
                payload: other,
                node_id: None,
                alias: None,
                principals: vec![],
                recipients: vec![],
            }],
            false,
        ))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
}

#[test]
fn wait_for_applied_times_out_with_applied_false() {
    let stack = Stack::new();
    // No applier running at all.
    let mut req = request("slow-1", s1_operations(), true);
    req.deadline = Some(Duration::from_millis(100));
    let receipt = stack.coordinator.execute(req).unwrap();
    assert!(!receipt.applied);
    assert!(!receipt.result_aliases.is_empty());
}

#[test]
fn broker_unavailability_surfaces_after_one_retry() {
    let stack = Stack::new();
    stack.wal.set_unavailable(true);
    let err = stack
        .coordinator
        .execute(request("unavail-1", s1_operations(), false))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServiceUnavailable);

    stack.wal.set_unavailable(false);
    assert!(stack
        .coordinator
        .execute(request("unavail-1", s1_operations(), false))
        .is_ok());
}

#[test]
fn unresolved_alias_is_invalid_request() {
    let stack = Stack::new();
    let ops = vec![Operation::CreateEdge {
        edge_type_id: 100,
        from: NodeRef::Alias(AliasRef::parse("$ghost.id").unwrap()),
        to: NodeRef::Alias(AliasRef::parse("$ghost.id").unwrap()),
        props: Payload::new(),
    }];
    let err = stack.coordinator.execute(request("ghost", ops, false)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
}

#[test]
fn record_at_broker_size_limit() {
    let stack = Stack::new();
    // A payload string close to the limit exceeds it after framing.
    let mut payload = Payload::new();
    payload.insert("email".into(), Value::Str("a@x".into()));
    payload.insert("name".into(), Value::Str("x".repeat(1024 * 1024)));
    let err = stack
        .coordinator
        .execute(request(
            "big-1",
            vec![Operation::CreateNode {
                type_id: 1,
                payload,
                node_id: None,
                alias: None,
                principals: vec![],
                recipients: vec![],
            }],
            false,
        ))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    assert!(matches!(err, CoordError::Wal(_)));
}

#[test]
fn server_lifecycle_with_mailbox_fanout() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.server.data_root = dir.path().to_path_buf();
    config.wal.backend = WalBackendKind::Memory;
    config.wal.partitions = 2;
    config.apply.poll_interval_ms = 10;

    let handle = Server::start(config, registry(), SnippetExtractors::new()).unwrap();

    let bob = Principal::parse("user:bob").unwrap();
    let mut task = Payload::new();
    task.insert("title".into(), Value::Str("review quarterly numbers".into()));
    let receipt = handle
        .execute(ExecuteRequest {
            tenant_id: tenant(),
            actor: alice(),
            idempotency_key: Some(IdempotencyKey::parse("srv-1").unwrap()),
            schema_fingerprint: Some(handle.registry().fingerprint().unwrap()),
            operations: vec![Operation::CreateNode {
                type_id: 2,
                payload: task,
                node_id: None,
                alias: Some("t".into()),
                principals: vec![Principal::TenantWildcard],
                recipients: vec![bob.clone()],
            }],
            wait_for_applied: true,
            deadline: Some(Duration::from_secs(5)),
        })
        .unwrap();
    assert!(receipt.applied);

    let node_id: NodeId = receipt.result_aliases.get("t").unwrap().clone();
    let access = ReadAccess::new(alice());
    let node = handle.get_node(&tenant(), &access, &node_id, false).unwrap();
    assert_eq!(node.payload.get("status"), Some(&Value::Enum("todo".into())));

    let items = handle.mailbox(&tenant(), &bob, 10, 0).unwrap();
    assert_eq!(items.len(), 1);
    let hits = handle.search(&tenant(), &bob, "quarterly", 10).unwrap();
    assert_eq!(hits.len(), 1);

    let health = handle.health();
    assert_eq!(health.status, "ok");
    assert_eq!(health.tenants.len(), 1);

    handle.stop();
}
