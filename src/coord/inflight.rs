//! Per-coordinator inflight idempotency cache.
//!
//! Soft state: losing it only costs an extra durable append that the
//! applier deduplicates through `applied_events`. What it must do is (a)
//! pin the ids assigned to a key so a retry re-frames the identical
//! event, and (b) hold the request-body fingerprint so a reused key with
//! a different body is rejected.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::core::{IdempotencyKey, Sha256, TenantId, TransactionEvent};
use crate::wal::WalPosition;

#[derive(Clone, Debug)]
pub(crate) struct InflightEntry {
    pub request_sha: Sha256,
    /// The fully resolved event; retries append these exact bytes again.
    pub event: TransactionEvent,
    /// Set once an append was acknowledged.
    pub position: Option<WalPosition>,
    pub receipt_id: String,
}

pub(crate) struct InflightCache {
    capacity: usize,
    entries: Mutex<CacheState>,
}

struct CacheState {
    map: HashMap<(TenantId, IdempotencyKey), InflightEntry>,
    order: VecDeque<(TenantId, IdempotencyKey)>,
}

impl InflightCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(CacheState {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, tenant: &TenantId, key: &IdempotencyKey) -> Option<InflightEntry> {
        let state = self.entries.lock().expect("inflight lock");
        state.map.get(&(tenant.clone(), key.clone())).cloned()
    }

    pub fn insert(&self, tenant: TenantId, key: IdempotencyKey, entry: InflightEntry) {
        let mut state = self.entries.lock().expect("inflight lock");
        let cache_key = (tenant, key);
        if state.map.insert(cache_key.clone(), entry).is_none() {
            state.order.push_back(cache_key);
        }
        while state.map.len() > self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.map.remove(&oldest);
        }
    }

    pub fn record_position(
        &self,
        tenant: &TenantId,
        key: &IdempotencyKey,
        position: WalPosition,
    ) {
        let mut state = self.entries.lock().expect("inflight lock");
        if let Some(entry) = state.map.get_mut(&(tenant.clone(), key.clone())) {
            entry.position = Some(position);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("inflight lock").map.len()
    }
}
