//! In-process WAL backend.
//!
//! Used by tests and single-process development. Same ordering and
//! position semantics as the disk log, plus an unavailability toggle so
//! callers can exercise the SERVICE_UNAVAILABLE path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::TenantId;

use super::{StartPos, Wal, WalConsumer, WalError, WalPosition, WalRecord};

struct PartitionSlot {
    records: Mutex<Vec<(String, Vec<u8>)>>,
    cond: Condvar,
}

struct Inner {
    partitions: Vec<PartitionSlot>,
    checkpoints: Mutex<HashMap<(String, u32), u64>>,
    unavailable: AtomicBool,
    max_record_bytes: usize,
}

#[derive(Clone)]
pub struct MemoryWal {
    inner: Arc<Inner>,
}

impl MemoryWal {
    pub fn new(partitions: u32, max_record_bytes: usize) -> Self {
        assert!(partitions > 0, "at least one partition");
        let partitions = (0..partitions)
            .map(|_| PartitionSlot {
                records: Mutex::new(Vec::new()),
                cond: Condvar::new(),
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                partitions,
                checkpoints: Mutex::new(HashMap::new()),
                unavailable: AtomicBool::new(false),
                max_record_bytes,
            }),
        }
    }

    /// Simulate broker quorum loss; appends fail Unavailable until
    /// cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn slot(&self, partition: u32) -> Result<&PartitionSlot, WalError> {
        self.inner
            .partitions
            .get(partition as usize)
            .ok_or(WalError::UnknownPartition {
                partition,
                partitions: self.partitions(),
            })
    }
}

impl Wal for MemoryWal {
    fn partitions(&self) -> u32 {
        self.inner.partitions.len() as u32
    }

    fn append(&self, key: &TenantId, record: &[u8]) -> Result<WalPosition, WalError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(WalError::Unavailable {
                reason: "broker marked unavailable".to_string(),
            });
        }
        if record.len() > self.inner.max_record_bytes {
            return Err(WalError::RecordTooLarge {
                max_bytes: self.inner.max_record_bytes,
                got_bytes: record.len(),
            });
        }
        let partition = self.partition_for_key(key);
        let slot = self.slot(partition)?;
        let mut records = slot.records.lock().expect("wal partition lock");
        records.push((key.as_str().to_string(), record.to_vec()));
        let offset = records.len() as u64 - 1;
        slot.cond.notify_all();
        Ok(WalPosition::new(partition, offset))
    }

    fn open_consumer(
        &self,
        partition: u32,
        group: &str,
        from: StartPos,
    ) -> Result<Box<dyn WalConsumer>, WalError> {
        self.slot(partition)?;
        let next = match from {
            StartPos::Earliest => 0,
            StartPos::After(pos) => {
                if pos.partition != partition {
                    return Err(WalError::UnknownPartition {
                        partition: pos.partition,
                        partitions: self.partitions(),
                    });
                }
                pos.offset + 1
            }
            StartPos::Checkpoint => self
                .read_checkpoint(group, partition)?
                .map(|pos| pos.offset + 1)
                .unwrap_or(0),
        };
        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            partition,
            next,
        }))
    }

    fn commit_checkpoint(&self, group: &str, position: WalPosition) -> Result<(), WalError> {
        self.slot(position.partition)?;
        let mut checkpoints = self.inner.checkpoints.lock().expect("checkpoint lock");
        checkpoints.insert((group.to_string(), position.partition), position.offset);
        Ok(())
    }

    fn read_checkpoint(
        &self,
        group: &str,
        partition: u32,
    ) -> Result<Option<WalPosition>, WalError> {
        self.slot(partition)?;
        let checkpoints = self.inner.checkpoints.lock().expect("checkpoint lock");
        Ok(checkpoints
            .get(&(group.to_string(), partition))
            .map(|&offset| WalPosition::new(partition, offset)))
    }

    fn earliest_position(&self, partition: u32) -> Result<Option<WalPosition>, WalError> {
        let slot = self.slot(partition)?;
        let records = slot.records.lock().expect("wal partition lock");
        Ok((!records.is_empty()).then(|| WalPosition::new(partition, 0)))
    }

    fn latest_position(&self, partition: u32) -> Result<Option<WalPosition>, WalError> {
        let slot = self.slot(partition)?;
        let records = slot.records.lock().expect("wal partition lock");
        Ok((!records.is_empty()).then(|| WalPosition::new(partition, records.len() as u64 - 1)))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    partition: u32,
    next: u64,
}

impl WalConsumer for MemoryConsumer {
    fn next_timeout(&mut self, timeout: Duration) -> Result<Option<WalRecord>, WalError> {
        let slot = self
            .inner
            .partitions
            .get(self.partition as usize)
            .ok_or(WalError::ConsumerClosed)?;
        let deadline = Instant::now() + timeout;
        let mut records = slot.records.lock().expect("wal partition lock");
        loop {
            if let Some((key, value)) = records.get(self.next as usize) {
                let record = WalRecord {
                    position: WalPosition::new(self.partition, self.next),
                    key: key.clone(),
                    value: value.clone(),
                };
                self.next += 1;
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, result) = slot
                .cond
                .wait_timeout(records, deadline - now)
                .expect("wal partition lock");
            records = guard;
            if result.timed_out() && records.len() as u64 <= self.next {
                return Ok(None);
            }
        }
    }
}
