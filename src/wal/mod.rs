//! WAL abstraction: an ordered, partitioned, replicated record stream.
//!
//! Records are opaque bytes; the partition key is the tenant id, which
//! gives per-tenant total order. Backends differ in retention units and
//! durability plumbing; the adapter absorbs those differences and the
//! applier sees only positions.
//!
//! Failure contract on `append`: errors are classified `Retryable`
//! (caller may retry with the same idempotency key), `Permanent`
//! (record-too-large; must not retry) or `Unavailable` (quorum lost;
//! surfaced as SERVICE_UNAVAILABLE).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::TenantId;
use crate::error::Transience;

pub mod frame;
pub mod log;
pub mod memory;

pub use log::DiskWal;
pub use memory::MemoryWal;

/// Position of one record: partition plus offset within it. Total order
/// is defined only within a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalPosition {
    pub partition: u32,
    pub offset: u64,
}

impl WalPosition {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl std::fmt::Display for WalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

/// One consumed record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub position: WalPosition,
    pub key: String,
    pub value: Vec<u8>,
}

/// Where a consumer starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPos {
    Earliest,
    /// Resume after the given position (exclusive).
    After(WalPosition),
    /// Resume from the backend's committed checkpoint for the group,
    /// falling back to earliest.
    Checkpoint,
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("record exceeds max bytes {max_bytes} (got {got_bytes})")]
    RecordTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("wal unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("wal data corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("unknown partition {partition} (of {partitions})")]
    UnknownPartition { partition: u32, partitions: u32 },
    #[error("consumer closed")]
    ConsumerClosed,
}

impl WalError {
    pub(crate) fn io_none(source: std::io::Error) -> Self {
        WalError::Io { path: None, source }
    }

    pub(crate) fn io_at(path: PathBuf, source: std::io::Error) -> Self {
        WalError::Io {
            path: Some(path),
            source,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            WalError::RecordTooLarge { .. }
            | WalError::Corrupt { .. }
            | WalError::UnknownPartition { .. } => Transience::Permanent,
            WalError::Io { .. } | WalError::Unavailable { .. } => Transience::Retryable,
            WalError::ConsumerClosed => Transience::Unknown,
        }
    }
}

/// A single consumer over one partition: ordered, gap-free.
pub trait WalConsumer: Send {
    /// Next record, waiting up to `timeout` for one to arrive. `Ok(None)`
    /// means caught up (no record within the timeout).
    fn next_timeout(&mut self, timeout: Duration) -> Result<Option<WalRecord>, WalError>;
}

/// The WAL itself. Implementations are shared across threads.
pub trait Wal: Send + Sync {
    fn partitions(&self) -> u32;

    /// Blocks until the configured acknowledgment policy is satisfied.
    fn append(&self, key: &TenantId, record: &[u8]) -> Result<WalPosition, WalError>;

    fn open_consumer(
        &self,
        partition: u32,
        group: &str,
        from: StartPos,
    ) -> Result<Box<dyn WalConsumer>, WalError>;

    /// Durably record apply progress out-of-band. Advisory: the applier's
    /// authoritative checkpoint lives in the tenant store.
    fn commit_checkpoint(
        &self,
        group: &str,
        position: WalPosition,
    ) -> Result<(), WalError>;

    fn read_checkpoint(&self, group: &str, partition: u32)
        -> Result<Option<WalPosition>, WalError>;

    /// First retained position, if the partition has any records.
    fn earliest_position(&self, partition: u32) -> Result<Option<WalPosition>, WalError>;

    /// Last appended position, if the partition has any records.
    fn latest_position(&self, partition: u32) -> Result<Option<WalPosition>, WalError>;

    /// Stable key -> partition mapping (fnv-1a over the key).
    fn partition_for_key(&self, key: &TenantId) -> u32 {
        partition_for(key.as_str(), self.partitions())
    }
}

/// fnv-1a; stable across processes so archives and checkpoints agree.
pub(crate) fn partition_for(key: &str, partitions: u32) -> u32 {
    debug_assert!(partitions > 0);
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % u64::from(partitions)) as u32
}
