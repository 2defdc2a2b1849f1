//! Archiver: tails the WAL and offloads it to object storage as
//! compressed, checksummed segments.
//!
//! Objects land under
//! `<prefix>/partition-<n>/<yyyymmdd>/<first_offset>.jsonl.gz`, one
//! event per line in WAL order, with a `.checksum` sibling carrying the
//! SHA-256 of the decompressed bytes. The archiver's committed position
//! advances only after both objects are written, so delivery is
//! at-least-once; every line carries its wal position, which makes
//! deduplication at replay trivial.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{decode_envelope, sha256_bytes, TransactionEvent};
use crate::error::Transience;
use crate::objstore::{ObjectStore, ObjectStoreError};
use crate::wal::{StartPos, Wal, WalError, WalPosition};

pub const CONSUMER_GROUP: &str = "entdb-archiver";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error("archive line encode failed: {0}")]
    Encode(String),
    #[error("archive line decode failed in {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("gzip failed: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("checksum mismatch for {key}: expected {expected}, got {got}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        got: String,
    },
    #[error("segment {key} has no checksum sibling")]
    ChecksumMissing { key: String },
}

impl ArchiveError {
    pub fn transience(&self) -> Transience {
        match self {
            ArchiveError::Wal(e) => e.transience(),
            ArchiveError::ObjectStore(e) => e.transience(),
            ArchiveError::Gzip(_) => Transience::Retryable,
            ArchiveError::Encode(_)
            | ArchiveError::Decode { .. }
            | ArchiveError::ChecksumMismatch { .. }
            | ArchiveError::ChecksumMissing { .. } => Transience::Permanent,
        }
    }
}

/// One archived event: the position plus the decoded body. The body is
/// re-encoded canonically at replay, so archive bytes and live WAL bytes
/// agree for the same position range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchiveLine {
    pub position: WalPosition,
    pub event: TransactionEvent,
}

#[derive(Clone, Debug)]
pub struct ArchiverConfig {
    pub object_prefix: String,
    pub segment_max_bytes: usize,
    pub segment_max_age: Duration,
    pub poll_interval: Duration,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            object_prefix: "archive".to_string(),
            segment_max_bytes: 256 * 1024 * 1024,
            segment_max_age: Duration::from_secs(600),
            poll_interval: Duration::from_millis(200),
        }
    }
}

struct PendingSegment {
    first_offset: u64,
    last_offset: u64,
    lines: Vec<u8>,
    opened_at: Instant,
}

pub struct Archiver {
    wal: Arc<dyn Wal>,
    store: Arc<dyn ObjectStore>,
    config: ArchiverConfig,
}

impl Archiver {
    pub fn new(wal: Arc<dyn Wal>, store: Arc<dyn ObjectStore>, config: ArchiverConfig) -> Self {
        Self { wal, store, config }
    }

    /// One worker per partition; never blocks writes, failures only log.
    pub fn start(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for partition in 0..self.wal.partitions() {
            let archiver = Arc::clone(self);
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("archiver-{partition}"))
                .spawn(move || archiver.run_partition(partition, &shutdown))
                .expect("spawn archiver worker");
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
                tracing::error!(partition, error = %err, "archiver failed to open consumer");
                return;
            }
        };
        tracing::info!(partition, "archiver worker started");
        let mut pending: Option<PendingSegment> = None;

        while !shutdown.load(Ordering::Relaxed) {
            match consumer.next_timeout(self.config.poll_interval) {
                Ok(Some(record)) => {
                    let line = match decode_envelope(&record.value) {
                        Ok(event) => ArchiveLine {
                            position: record.position,
                            event,
                        },
                        Err(err) => {
                            // The applier dead-letters it; the archive
                            // just skips it.
                            tracing::warn!(
                                partition,
                                position = %record.position,
                                error = %err,
                                "skipping undecodable record"
                            );
                            continue;
                        }
                    };
                    if let Err(err) = self.buffer_line(partition, &mut pending, line) {
                        tracing::error!(partition, error = %err, "archive flush failed");
                    }
                }
                Ok(None) => {
                    if let Err(err) = self.flush_if_aged(partition, &mut pending) {
                        tracing::error!(partition, error = %err, "archive flush failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(partition, error = %err, "archiver consumer error");
                    std::thread::sleep(self.config.poll_interval);
                }
            }
        }

        // Cooperative drain: archive whatever the log already holds,
        // then flush the open segment.
        loop {
            match consumer.next_timeout(Duration::from_millis(10)) {
                Ok(Some(record)) => {
                    let Ok(event) = decode_envelope(&record.value) else {
                        continue;
                    };
                    let line = ArchiveLine {
                        position: record.position,
                        event,
                    };
                    if let Err(err) = self.buffer_line(partition, &mut pending, line) {
                        tracing::error!(partition, error = %err, "archive drain flush failed");
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(partition, error = %err, "archiver drain error");
                    break;
                }
            }
        }
        if let Some(segment) = pending.take() {
            if let Err(err) = self.flush_segment(partition, segment) {
                tracing::error!(partition, error = %err, "final archive flush failed");
            }
        }
        tracing::info!(partition, "archiver worker stopped");
    }

    fn buffer_line(
        &self,
        partition: u32,
        pending: &mut Option<PendingSegment>,
        line: ArchiveLine,
    ) -> Result<(), ArchiveError> {
        let mut encoded =
            serde_json::to_vec(&line).map_err(|e| ArchiveError::Encode(e.to_string()))?;
        encoded.push(b'\n');

        let segment = pending.get_or_insert_with(|| PendingSegment {
            first_offset: line.position.offset,
            last_offset: line.position.offset,
            lines: Vec::new(),
            opened_at: Instant::now(),
        });
        segment.lines.extend_from_slice(&encoded);
        segment.last_offset = line.position.offset;

        let full = segment.lines.len() >= self.config.segment_max_bytes;
        let aged = segment.opened_at.elapsed() >= self.config.segment_max_age;
        if full || aged {
            let segment = pending.take().expect("pending segment present");
            self.flush_segment(partition, segment)?;
        }
        Ok(())
    }

    fn flush_if_aged(
        &self,
        partition: u32,
        pending: &mut Option<PendingSegment>,
    ) -> Result<(), ArchiveError> {
        let aged = pending
            .as_ref()
            .map(|s| s.opened_at.elapsed() >= self.config.segment_max_age)
            .unwrap_or(false);
        if aged {
            let segment = pending.take().expect("pending segment present");
            self.flush_segment(partition, segment)?;
        }
        Ok(())
    }

    fn flush_segment(&self, partition: u32, segment: PendingSegment) -> Result<(), ArchiveError> {
        let key = self.segment_key(partition, segment.first_offset);
        let checksum = sha256_bytes(&segment.lines).to_hex();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&segment.lines)
            .map_err(ArchiveError::Gzip)?;
        let compressed = encoder.finish().map_err(ArchiveError::Gzip)?;

        self.store.put(&key, &compressed)?;
        self.store
            .put(&checksum_key(&key), checksum.as_bytes())?;

        // Only now does the committed position move.
        self.wal.commit_checkpoint(
            CONSUMER_GROUP,
            WalPosition::new(partition, segment.last_offset),
        )?;
        tracing::info!(
            partition,
            key,
            first = segment.first_offset,
            last = segment.last_offset,
            bytes = compressed.len(),
            "archived segment"
        );
        Ok(())
    }

    fn segment_key(&self, partition: u32, first_offset: u64) -> String {
        format!(
            "{}/partition-{partition:03}/{}/{first_offset:020}.jsonl.gz",
            self.config.object_prefix,
            utc_date_stamp()
        )
    }
}

fn checksum_key(segment_key: &str) -> String {
    format!("{segment_key}.checksum")
}

fn utc_date_stamp() -> String {
    // Days-since-epoch to civil date; good enough for object layout.
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = secs / 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    format!("{year:04}{month:02}{day:02}")
}

/// Howard Hinnant's days-to-civil algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d as u32)
}

/// A segment reference in listing order (which is offset order within a
/// partition because keys embed zero-padded first offsets).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRef {
    pub key: String,
}

/// List archive segments for a partition, ascending.
pub fn list_segments(
    store: &dyn ObjectStore,
    object_prefix: &str,
    partition: u32,
) -> Result<Vec<SegmentRef>, ArchiveError> {
    let prefix = format!("{object_prefix}/partition-{partition:03}");
    let mut segments: Vec<SegmentRef> = store
        .list(&prefix)?
        .into_iter()
        .filter(|key| key.ends_with(".jsonl.gz"))
        .map(|key| SegmentRef { key })
        .collect();
    // Keys sort by date dir first; offsets are monotone across dates, so
    // the order is already replay order. Sort defensively by the
    // trailing offset component anyway.
    segments.sort_by_key(|s| segment_first_offset(&s.key));
    Ok(segments)
}

fn segment_first_offset(key: &str) -> u64 {
    key.rsplit('/')
        .next()
        .and_then(|name| name.strip_suffix(".jsonl.gz"))
        .and_then(|stem| stem.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Read one segment, verifying its checksum sibling.
pub fn read_segment(
    store: &dyn ObjectStore,
    segment: &SegmentRef,
) -> Result<Vec<ArchiveLine>, ArchiveError> {
    let compressed = store
        .get(&segment.key)?
        .ok_or_else(|| ArchiveError::Decode {
            key: segment.key.clone(),
            reason: "segment object missing".to_string(),
        })?;
    let expected = store
        .get(&checksum_key(&segment.key))?
        .ok_or_else(|| ArchiveError::ChecksumMissing {
            key: segment.key.clone(),
        })?;
    let expected = String::from_utf8_lossy(&expected).trim().to_string();

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw).map_err(ArchiveError::Gzip)?;

    let got = sha256_bytes(&raw).to_hex();
    if got != expected {
        return Err(ArchiveError::ChecksumMismatch {
            key: segment.key.clone(),
            expected,
            got,
        });
    }

    let mut lines = Vec::new();
    for line in raw.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        let line: ArchiveLine =
            serde_json::from_slice(line).map_err(|e| ArchiveError::Decode {
                key: segment.key.clone(),
                reason: e.to_string(),
            })?;
        lines.push(line);
    }
    Ok(lines)
}

/// All archived events for a partition strictly after `after`, oldest
/// first, deduplicated by offset (at-least-once delivery upstream).
pub fn replay(
    store: &dyn ObjectStore,
    object_prefix: &str,
    partition: u32,
    after: Option<u64>,
) -> Result<Vec<ArchiveLine>, ArchiveError> {
    let mut by_offset: BTreeMap<u64, ArchiveLine> = BTreeMap::new();
    for segment in list_segments(store, object_prefix, partition)? {
        for line in read_segment(store, &segment)? {
            if let Some(after) = after {
                if line.position.offset <= after {
                    continue;
                }
            }
            by_offset.entry(line.position.offset).or_insert(line);
        }
    }
    Ok(by_offset.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn checksum_key_shape() {
        assert_eq!(
            checksum_key("archive/partition-000/20250101/00000000000000000000.jsonl.gz"),
            "archive/partition-000/20250101/00000000000000000000.jsonl.gz.checksum"
        );
    }

    #[test]
    fn segment_first_offset_parses() {
        assert_eq!(
            segment_first_offset("a/p/20250101/00000000000000000042.jsonl.gz"),
            42
        );
    }
}
