//! Applier: the long-running consumer that materializes WAL events into
//! tenant stores.
//!
//! One worker per partition; within a partition records apply strictly
//! serially, which (with tenant-keyed partitioning) gives per-tenant
//! total order. The per-tenant checkpoint inside `tenant_meta` is the
//! authoritative apply progress; the WAL's own committed checkpoint is
//! an advisory resume hint and is always committed after the store
//! transaction, so resuming from it can only replay records that the
//! `applied_events` lookup skips.
//!
//! Failure policy: transient store errors retry with capped backoff and
//! never advance the checkpoint; validation failures and invariant
//! violations go to the dead-letter and the stream moves on; conflicts
//! are results, not errors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::{decode_envelope, TenantId, TransactionEvent};
use crate::error::Transience;
use crate::schema::SchemaRegistry;
use crate::store::{ApplyOutcome, SnippetExtractors, StoreError, TenantStores};
use crate::wal::{StartPos, Wal, WalError, WalPosition, WalRecord};

mod deadletter;

pub use deadletter::{DeadLetter, DeadLetterEntry};

pub const CONSUMER_GROUP: &str = "entdb-applier";

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dead-letter io at {path:?}: {source}")]
    DeadLetterIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dead-letter encode failed: {reason}")]
    DeadLetterEncode { reason: String },
}

impl ApplyError {
    pub fn transience(&self) -> Transience {
        match self {
            ApplyError::Wal(e) => e.transience(),
            ApplyError::Store(e) => e.transience(),
            ApplyError::DeadLetterIo { .. } => Transience::Retryable,
            ApplyError::DeadLetterEncode { .. } => Transience::Permanent,
        }
    }
}

/// Per-tenant applied positions with a condition variable so
/// `wait_for_applied` callers can block until their record lands.
pub struct AppliedTracker {
    state: Mutex<HashMap<TenantId, WalPosition>>,
    cond: Condvar,
}

impl AppliedTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    pub fn publish(&self, tenant: &TenantId, position: WalPosition) {
        let mut state = self.state.lock().expect("applied tracker lock");
        let entry = state.entry(tenant.clone()).or_insert(position);
        if position.offset >= entry.offset {
            *entry = position;
        }
        self.cond.notify_all();
    }

    pub fn get(&self, tenant: &TenantId) -> Option<WalPosition> {
        let state = self.state.lock().expect("applied tracker lock");
        state.get(tenant).copied()
    }

    /// Block until the tenant's applied position reaches `target` or the
    /// timeout elapses. Returns whether the target was reached.
    pub fn wait_for(&self, tenant: &TenantId, target: WalPosition, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("applied tracker lock");
        loop {
            if let Some(applied) = state.get(tenant) {
                if applied.partition == target.partition && applied.offset >= target.offset {
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("applied tracker lock");
            state = guard;
        }
    }
}

impl Default for AppliedTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ApplierConfig {
    /// How long one consumer poll waits before rechecking shutdown.
    pub poll_interval: Duration,
    pub max_retry_backoff: Duration,
    pub deadletter_dir: PathBuf,
}

impl ApplierConfig {
    pub fn new(deadletter_dir: impl Into<PathBuf>) -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(5_000),
            deadletter_dir: deadletter_dir.into(),
        }
    }
}

pub struct Applier {
    wal: Arc<dyn Wal>,
    stores: Arc<TenantStores>,
    registry: Arc<SchemaRegistry>,
    snippets: Arc<SnippetExtractors>,
    tracker: Arc<AppliedTracker>,
    deadletter: DeadLetter,
    config: ApplierConfig,
}

impl Applier {
    pub fn new(
        wal: Arc<dyn Wal>,
        stores: Arc<TenantStores>,
        registry: Arc<SchemaRegistry>,
        snippets: Arc<SnippetExtractors>,
        tracker: Arc<AppliedTracker>,
        config: ApplierConfig,
    ) -> Self {
        let deadletter = DeadLetter::new(&config.deadletter_dir);
        Self {
            wal,
            stores,
            registry,
            snippets,
            tracker,
            deadletter,
            config,
        }
    }

    pub fn tracker(&self) -> Arc<AppliedTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn deadletter(&self) -> &DeadLetter {
        &self.deadletter
    }

    /// Seed the applied tracker from each tenant's authoritative
    /// checkpoint. Run once before spawning workers so `wait_for_applied`
    /// and read gates see positions recovered across restarts.
    pub fn recover_applied_positions(&self) -> Result<(), ApplyError> {
        for tenant in self.stores.list_tenants()? {
            let store = self.stores.acquire(&tenant)?;
            if let Some(position) = store.checkpoint()? {
                self.tracker.publish(&tenant, position);
            }
        }
        Ok(())
    }

    /// Spawn one worker thread per partition. Workers drain their
    /// current record and exit when `shutdown` flips.
    pub fn start(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for partition in 0..self.wal.partitions() {
            let applier = Arc::clone(self);
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("applier-{partition}"))
                .spawn(move || applier.run_partition(partition, &shutdown))
                .expect("spawn applier worker");
            handles.push(handle);
        }
        handles
    }

    fn run_partition(&self, partition: u32, shutdown: &AtomicBool) {
        let mut consumer = match self
            .wal
            .open_consumer(partition, CONSUMER_GROUP, StartPos::Checkpoint)
        {
            Ok(consumer) => consumer,
            Err(err) => {
                tracing::error!(partition, error = %err, "applier failed to open consumer");
                return;
            }
        };
        tracing::info!(partition, "applier worker started");

        while !shutdown.load(Ordering::Relaxed) {
            let record = match consumer.next_timeout(self.config.poll_interval) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(partition, error = %err, "consumer error; backing off");
                    std::thread::sleep(self.config.poll_interval);
                    continue;
                }
            };
            self.process_record(partition, record, shutdown);
        }
        tracing::info!(partition, "applier worker stopped");
    }

    fn process_record(&self, partition: u32, record: WalRecord, shutdown: &AtomicBool) {
        let position = record.position;
        let event = match decode_envelope(&record.value) {
            Ok(event) => event,
            Err(err) => {
                // Undecodable events are durable but unusable; isolate
                // and move on rather than blocking the partition.
                let _ = self
                    .deadletter
                    .record(position, None, &format!("envelope decode failed: {err}"));
                self.commit_advisory(position);
                return;
            }
        };
        if event.tenant_id.as_str() != record.key {
            let _ = self.deadletter.record(
                position,
                Some(&event),
                &format!("partition key {:?} does not match event tenant", record.key),
            );
            self.commit_advisory(position);
            return;
        }

        match self.apply_with_retry(&event, position, shutdown) {
            Ok(true) => {
                self.tracker.publish(&event.tenant_id, position);
                self.commit_advisory(position);
            }
            Ok(false) => {
                // Shutdown interrupted the retry loop; do not advance.
            }
            Err(err) => {
                let _ = self
                    .deadletter
                    .record(position, Some(&event), &err.to_string());
                self.commit_advisory(position);
            }
        }

        if position.partition != partition {
            tracing::error!(partition, position = %position, "record position from wrong partition");
        }
    }

    /// Apply one event, retrying transient store failures with capped
    /// exponential backoff. `Ok(false)` means shutdown interrupted the
    /// loop before the event applied.
    fn apply_with_retry(
        &self,
        event: &TransactionEvent,
        position: WalPosition,
        shutdown: &AtomicBool,
    ) -> Result<bool, StoreError> {
        let mut backoff = Duration::from_millis(10);
        loop {
            let attempt = self.apply_once(event, position);
            match attempt {
                Ok(outcome) => {
                    if let ApplyOutcome::AlreadyApplied { .. } = outcome {
                        tracing::debug!(
                            tenant = %event.tenant_id,
                            key = %event.idempotency_key,
                            position = %position,
                            "skipped already-applied event"
                        );
                    }
                    return Ok(true);
                }
                Err(err) if err.transience().is_retryable() => {
                    tracing::warn!(
                        tenant = %event.tenant_id,
                        position = %position,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient apply failure; retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.config.max_retry_backoff);
                    if shutdown.load(Ordering::Relaxed) {
                        return Ok(false);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn apply_once(
        &self,
        event: &TransactionEvent,
        position: WalPosition,
    ) -> Result<ApplyOutcome, StoreError> {
        let store = self.stores.acquire(&event.tenant_id)?;
        if store.schema_fingerprint()?.is_none() {
            store.set_schema_fingerprint(&event.schema_fingerprint.to_string())?;
        }
        // Events framed under an older (compatible) schema still apply:
        // evolution rules guarantee the live schema validates them, and
        // validation inside the transaction is what catches real drift.
        if let Ok(current) = self.registry.fingerprint() {
            if current != event.schema_fingerprint {
                tracing::debug!(
                    tenant = %event.tenant_id,
                    event_fingerprint = %event.schema_fingerprint,
                    "applying event framed under an older schema"
                );
            }
        }
        store.apply_transaction(&self.registry, &self.snippets, event, position)
    }

    fn commit_advisory(&self, position: WalPosition) {
        if let Err(err) = self.wal.commit_checkpoint(CONSUMER_GROUP, position) {
            // Advisory only: losing it widens the replay window, never
            // correctness.
            tracing::warn!(position = %position, error = %err, "advisory checkpoint commit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_wait_observes_publish() {
        let tracker = Arc::new(AppliedTracker::new());
        let tenant = TenantId::parse("t1").unwrap();
        let target = WalPosition::new(0, 3);

        assert!(!tracker.wait_for(&tenant, target, Duration::from_millis(20)));

        let publisher = Arc::clone(&tracker);
        let t = tenant.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish(&t, WalPosition::new(0, 3));
        });
        assert!(tracker.wait_for(&tenant, target, Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn tracker_does_not_move_backwards() {
        let tracker = AppliedTracker::new();
        let tenant = TenantId::parse("t1").unwrap();
        tracker.publish(&tenant, WalPosition::new(0, 5));
        tracker.publish(&tenant, WalPosition::new(0, 2));
        assert_eq!(tracker.get(&tenant), Some(WalPosition::new(0, 5)));
    }

    #[test]
    fn tracker_satisfied_by_later_position() {
        let tracker = AppliedTracker::new();
        let tenant = TenantId::parse("t1").unwrap();
        tracker.publish(&tenant, WalPosition::new(0, 9));
        assert!(tracker.wait_for(&tenant, WalPosition::new(0, 4), Duration::from_millis(1)));
    }
}
