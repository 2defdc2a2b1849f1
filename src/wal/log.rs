//! Durable partitioned disk log.
//!
//! Layout: `<root>/partition-<n>/<base_offset 20 digits>.wal` segment
//! files of crc-framed records, plus `<root>/checkpoints/` for advisory
//! consumer checkpoints. Offsets are dense per partition, starting at 0;
//! a segment's file name is the offset of its first record, so the
//! in-memory offset index can be rebuilt by scanning segments in name
//! order.
//!
//! Durability: `append` writes the frame and, with `sync_on_append`
//! (the `acks=all` policy), fsyncs before returning - the fsync is the
//! acknowledgment barrier. A torn frame at the tail of the last segment
//! is truncated away on open; torn frames anywhere else are corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crc32c::crc32c;

use crate::core::TenantId;

use super::frame::{encode_frame, FrameReader};
use super::{StartPos, Wal, WalConsumer, WalError, WalPosition, WalRecord};

const SEGMENT_SUFFIX: &str = ".wal";
const FRAME_HEADER_LEN: u64 = 12;

#[derive(Clone, Copy, Debug)]
pub struct DiskWalConfig {
    pub partitions: u32,
    pub max_record_bytes: usize,
    pub segment_max_bytes: u64,
    /// fsync each append before acknowledging (acks=all).
    pub sync_on_append: bool,
}

impl Default for DiskWalConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            max_record_bytes: 1024 * 1024,
            segment_max_bytes: 64 * 1024 * 1024,
            sync_on_append: true,
        }
    }
}

#[derive(Clone, Copy)]
struct RecordLoc {
    segment: usize,
    pos: u64,
    len: u32,
}

struct SegmentInfo {
    path: PathBuf,
}

struct PartitionLog {
    dir: PathBuf,
    segments: Vec<SegmentInfo>,
    index: Vec<RecordLoc>,
    writer: File,
    /// Bytes written to the active (last) segment.
    written: u64,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.index.len() as u64
    }
}

struct Slot {
    log: Mutex<PartitionLog>,
    cond: Condvar,
}

struct DiskInner {
    root: PathBuf,
    config: DiskWalConfig,
    slots: Vec<Slot>,
}

#[derive(Clone)]
pub struct DiskWal {
    inner: Arc<DiskInner>,
}

impl DiskWal {
    pub fn open(root: impl Into<PathBuf>, config: DiskWalConfig) -> Result<Self, WalError> {
        assert!(config.partitions > 0, "at least one partition");
        let root = root.into();
        fs::create_dir_all(root.join("checkpoints"))
            .map_err(|e| WalError::io_at(root.join("checkpoints"), e))?;

        let mut slots = Vec::with_capacity(config.partitions as usize);
        for partition in 0..config.partitions {
            let dir = root.join(format!("partition-{partition:03}"));
            fs::create_dir_all(&dir).map_err(|e| WalError::io_at(dir.clone(), e))?;
            let log = open_partition(dir, &config)?;
            slots.push(Slot {
                log: Mutex::new(log),
                cond: Condvar::new(),
            });
        }
        Ok(Self {
            inner: Arc::new(DiskInner {
                root,
                config,
                slots,
            }),
        })
    }

    fn slot(&self, partition: u32) -> Result<&Slot, WalError> {
        self.inner
            .slots
            .get(partition as usize)
            .ok_or(WalError::UnknownPartition {
                partition,
                partitions: self.partitions(),
            })
    }

    fn checkpoint_path(&self, group: &str, partition: u32) -> PathBuf {
        // Group names come from our own components; sanitize anyway.
        let safe: String = group
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.inner
            .root
            .join("checkpoints")
            .join(format!("{safe}-{partition}.json"))
    }
}

impl Wal for DiskWal {
    fn partitions(&self) -> u32 {
        self.inner.config.partitions
    }

    fn append(&self, key: &TenantId, record: &[u8]) -> Result<WalPosition, WalError> {
        let frame = encode_frame(
            key.as_str(),
            record,
            self.inner.config.max_record_bytes,
        )?;
        let partition = self.partition_for_key(key);
        let slot = self.slot(partition)?;
        let mut log = slot.log.lock().expect("partition log lock");

        if log.written >= self.inner.config.segment_max_bytes && log.written > 0 {
            rotate_segment(&mut log)?;
        }

        let pos = log.written;
        let path = active_path(&log);
        log.writer
            .write_all(&frame)
            .map_err(|e| WalError::io_at(path.clone(), e))?;
        if self.inner.config.sync_on_append {
            log.writer
                .sync_data()
                .map_err(|e| WalError::io_at(path, e))?;
        }
        let segment = log.segments.len() - 1;
        log.index.push(RecordLoc {
            segment,
            pos,
            len: frame.len() as u32,
        });
        log.written += frame.len() as u64;
        let offset = log.next_offset() - 1;
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
        Ok(Box::new(DiskConsumer {
            inner: Arc::clone(&self.inner),
            partition,
            next,
            cached: None,
        }))
    }

    fn commit_checkpoint(&self, group: &str, position: WalPosition) -> Result<(), WalError> {
        self.slot(position.partition)?;
        let path = self.checkpoint_path(group, position.partition);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(&position).map_err(|e| WalError::Corrupt {
            reason: format!("checkpoint encode failed: {e}"),
        })?;
        fs::write(&tmp, body).map_err(|e| WalError::io_at(tmp.clone(), e))?;
        fs::rename(&tmp, &path).map_err(|e| WalError::io_at(path, e))?;
        Ok(())
    }

    fn read_checkpoint(
        &self,
        group: &str,
        partition: u32,
    ) -> Result<Option<WalPosition>, WalError> {
        self.slot(partition)?;
        let path = self.checkpoint_path(group, partition);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WalError::io_at(path, e)),
        };
        let position: WalPosition = serde_json::from_slice(&body).map_err(|e| {
            WalError::Corrupt {
                reason: format!("checkpoint decode failed at {path:?}: {e}"),
            }
        })?;
        Ok(Some(position))
    }

    fn earliest_position(&self, partition: u32) -> Result<Option<WalPosition>, WalError> {
        let slot = self.slot(partition)?;
        let log = slot.log.lock().expect("partition log lock");
        Ok((log.next_offset() > 0).then(|| WalPosition::new(partition, 0)))
    }

    fn latest_position(&self, partition: u32) -> Result<Option<WalPosition>, WalError> {
        let slot = self.slot(partition)?;
        let log = slot.log.lock().expect("partition log lock");
        let next = log.next_offset();
        Ok((next > 0).then(|| WalPosition::new(partition, next - 1)))
    }
}

fn active_path(log: &PartitionLog) -> PathBuf {
    log.segments
        .last()
        .map(|s| s.path.clone())
        .unwrap_or_else(|| log.dir.clone())
}

fn segment_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{base_offset:020}{SEGMENT_SUFFIX}"))
}

fn rotate_segment(log: &mut PartitionLog) -> Result<(), WalError> {
    let path = active_path(log);
    log.writer
        .sync_data()
        .map_err(|e| WalError::io_at(path, e))?;
    let base = log.next_offset();
    let path = segment_path(&log.dir, base);
    let file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)
        .map_err(|e| WalError::io_at(path.clone(), e))?;
    log.segments.push(SegmentInfo { path });
    log.writer = file;
    log.written = 0;
    Ok(())
}

fn open_partition(dir: PathBuf, config: &DiskWalConfig) -> Result<PartitionLog, WalError> {
    let mut bases = Vec::new();
    let entries = fs::read_dir(&dir).map_err(|e| WalError::io_at(dir.clone(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| WalError::io_at(dir.clone(), e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(SEGMENT_SUFFIX) {
            let base = stem.parse::<u64>().map_err(|_| WalError::Corrupt {
                reason: format!("segment name not an offset: {name}"),
            })?;
            bases.push(base);
        }
    }
    bases.sort_unstable();

    let mut segments = Vec::new();
    let mut index = Vec::new();
    let count = bases.len();
    let mut last_valid_len = 0u64;
    for (i, base) in bases.into_iter().enumerate() {
        if base != index.len() as u64 {
            return Err(WalError::Corrupt {
                reason: format!(
                    "segment base {base} does not match record count {}",
                    index.len()
                ),
            });
        }
        let path = segment_path(&dir, base);
        let is_last = i + 1 == count;
        let (locs, valid_len) = scan_segment(&path, config.max_record_bytes, is_last)?;
        let segment_idx = segments.len();
        for (pos, len) in locs {
            index.push(RecordLoc {
                segment: segment_idx,
                pos,
                len,
            });
        }
        segments.push(SegmentInfo { path });
        if is_last {
            last_valid_len = valid_len;
        }
    }

    if segments.is_empty() {
        let path = segment_path(&dir, 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| WalError::io_at(path.clone(), e))?;
        segments.push(SegmentInfo { path });
        return Ok(PartitionLog {
            dir,
            segments,
            index,
            writer: file,
            written: 0,
        });
    }

    // Drop any torn tail so new frames never interleave with garbage.
    let active = segments.last().expect("segments non-empty");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&active.path)
        .map_err(|e| WalError::io_at(active.path.clone(), e))?;
    file.set_len(last_valid_len)
        .map_err(|e| WalError::io_at(active.path.clone(), e))?;
    let mut file = file;
    file.seek(SeekFrom::End(0))
        .map_err(|e| WalError::io_at(active.path.clone(), e))?;

    Ok(PartitionLog {
        dir,
        segments,
        index,
        writer: file,
        written: last_valid_len,
    })
}

/// Scan a segment: positions and lengths of each complete frame, plus
/// the byte length of the valid prefix.
fn scan_segment(
    path: &Path,
    max_record_bytes: usize,
    is_last: bool,
) -> Result<(Vec<(u64, u32)>, u64), WalError> {
    let file = File::open(path).map_err(|e| WalError::io_at(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);
    let mut locs = Vec::new();
    let mut pos = 0u64;

    loop {
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        let got = read_some(&mut reader, &mut header)
            .map_err(|e| WalError::io_at(path.to_path_buf(), e))?;
        if got == 0 {
            break;
        }
        if got < header.len() {
            return torn_or_corrupt(path, is_last, locs, pos, "truncated frame header");
        }
        let payload_len =
            u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if payload_len < 2 || payload_len > max_record_bytes + 2 + u16::MAX as usize {
            return torn_or_corrupt(path, is_last, locs, pos, "frame length out of range");
        }
        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let mut payload = vec![0u8; payload_len];
        let got = read_some(&mut reader, &mut payload)
            .map_err(|e| WalError::io_at(path.to_path_buf(), e))?;
        if got < payload.len() {
            return torn_or_corrupt(path, is_last, locs, pos, "truncated frame payload");
        }
        if crc32c(&payload) != expected_crc {
            return torn_or_corrupt(path, is_last, locs, pos, "frame crc mismatch");
        }
        let len = FRAME_HEADER_LEN + payload_len as u64;
        locs.push((pos, len as u32));
        pos += len;
    }
    Ok((locs, pos))
}

fn torn_or_corrupt(
    path: &Path,
    is_last: bool,
    locs: Vec<(u64, u32)>,
    valid_len: u64,
    reason: &str,
) -> Result<(Vec<(u64, u32)>, u64), WalError> {
    if is_last {
        tracing::warn!(?path, reason, valid_len, "dropping torn tail of active segment");
        Ok((locs, valid_len))
    } else {
        Err(WalError::Corrupt {
            reason: format!("{reason} in sealed segment {path:?}"),
        })
    }
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

struct DiskConsumer {
    inner: Arc<DiskInner>,
    partition: u32,
    next: u64,
    cached: Option<(usize, File)>,
}

impl WalConsumer for DiskConsumer {
    fn next_timeout(&mut self, timeout: Duration) -> Result<Option<WalRecord>, WalError> {
        let slot = self
            .inner
            .slots
            .get(self.partition as usize)
            .ok_or(WalError::ConsumerClosed)?;
        let deadline = Instant::now() + timeout;

        let (loc, path) = {
            let mut log = slot.log.lock().expect("partition log lock");
            loop {
                if self.next < log.next_offset() {
                    let loc = log.index[self.next as usize];
                    let path = log.segments[loc.segment].path.clone();
                    break (loc, path);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                let (guard, result) = slot
                    .cond
                    .wait_timeout(log, deadline - now)
                    .expect("partition log lock");
                log = guard;
                if result.timed_out() && self.next >= log.next_offset() {
                    return Ok(None);
                }
            }
        };

        let record = self.read_at(loc, &path)?;
        let position = WalPosition::new(self.partition, self.next);
        self.next += 1;
        Ok(Some(WalRecord {
            position,
            key: record.0,
            value: record.1,
        }))
    }
}

impl DiskConsumer {
    fn read_at(&mut self, loc: RecordLoc, path: &Path) -> Result<(String, Vec<u8>), WalError> {
        let reuse = matches!(&self.cached, Some((segment, _)) if *segment == loc.segment);
        if !reuse {
            let file = File::open(path).map_err(|e| WalError::io_at(path.to_path_buf(), e))?;
            self.cached = Some((loc.segment, file));
        }
        let (_, file) = self.cached.as_mut().expect("cached reader");
        file.seek(SeekFrom::Start(loc.pos))
            .map_err(|e| WalError::io_at(path.to_path_buf(), e))?;
        let mut buf = vec![0u8; loc.len as usize];
        file.read_exact(&mut buf)
            .map_err(|e| WalError::io_at(path.to_path_buf(), e))?;

        let mut reader = FrameReader::new(
            std::io::Cursor::new(buf),
            self.inner.config.max_record_bytes,
        );
        let framed = reader.read_next()?.ok_or_else(|| WalError::Corrupt {
            reason: format!("indexed frame missing at {path:?} pos {}", loc.pos),
        })?;
        Ok((framed.key, framed.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    fn small_config() -> DiskWalConfig {
        DiskWalConfig {
            partitions: 2,
            max_record_bytes: 1024,
            segment_max_bytes: 128,
            sync_on_append: true,
        }
    }

    #[test]
    fn append_consume_roundtrip() {
        let dir = TempDir::new().unwrap();
        let wal = DiskWal::open(dir.path(), small_config()).unwrap();
        let t = tenant("t1");
        let partition = wal.partition_for_key(&t);
        for i in 0..5u8 {
            let pos = wal.append(&t, &[i]).unwrap();
            assert_eq!(pos.offset, u64::from(i));
        }
        let mut consumer = wal
            .open_consumer(partition, "g", StartPos::Earliest)
            .unwrap();
        for i in 0..5u8 {
            let record = consumer
                .next_timeout(Duration::from_millis(200))
                .unwrap()
                .unwrap();
            assert_eq!(record.value, vec![i]);
            assert_eq!(record.key, "t1");
        }
        assert!(consumer
            .next_timeout(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn segments_rotate_and_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let t = tenant("t1");
        let partition;
        {
            let wal = DiskWal::open(dir.path(), small_config()).unwrap();
            partition = wal.partition_for_key(&t);
            for i in 0..50u8 {
                wal.append(&t, &[i; 16]).unwrap();
            }
        }

        let wal = DiskWal::open(dir.path(), small_config()).unwrap();
        assert_eq!(
            wal.latest_position(partition).unwrap(),
            Some(WalPosition::new(partition, 49))
        );
        let mut consumer = wal
            .open_consumer(partition, "g", StartPos::Earliest)
            .unwrap();
        for i in 0..50u8 {
            let record = consumer
                .next_timeout(Duration::from_millis(200))
                .unwrap()
                .unwrap();
            assert_eq!(record.value, vec![i; 16]);
        }
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let t = tenant("t1");
        let mut config = small_config();
        config.segment_max_bytes = 1024 * 1024; // single segment
        let partition;
        {
            let wal = DiskWal::open(dir.path(), config).unwrap();
            partition = wal.partition_for_key(&t);
            wal.append(&t, b"one").unwrap();
            wal.append(&t, b"two").unwrap();
        }

        // Chop bytes off the tail to simulate a crash mid-append.
        let seg = dir
            .path()
            .join(format!("partition-{partition:03}"))
            .join(format!("{:020}.wal", 0));
        let len = fs::metadata(&seg).unwrap().len();
        let file = OpenOptions::new().write(true).open(&seg).unwrap();
        file.set_len(len - 2).unwrap();

        let wal = DiskWal::open(dir.path(), config).unwrap();
        assert_eq!(
            wal.latest_position(partition).unwrap(),
            Some(WalPosition::new(partition, 0))
        );
        // Appending after truncation lands at offset 1.
        let pos = wal.append(&t, b"three").unwrap();
        assert_eq!(pos.offset, 1);
        let mut consumer = wal
            .open_consumer(partition, "g", StartPos::Earliest)
            .unwrap();
        let first = consumer
            .next_timeout(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(first.value, b"one");
        let second = consumer
            .next_timeout(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(second.value, b"three");
    }

    #[test]
    fn checkpoint_roundtrip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let wal = DiskWal::open(dir.path(), small_config()).unwrap();
            wal.commit_checkpoint("apply", WalPosition::new(1, 7)).unwrap();
        }
        let wal = DiskWal::open(dir.path(), small_config()).unwrap();
        assert_eq!(
            wal.read_checkpoint("apply", 1).unwrap(),
            Some(WalPosition::new(1, 7))
        );
        let mut consumer = wal.open_consumer(1, "apply", StartPos::Checkpoint).unwrap();
        assert!(consumer
            .next_timeout(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn oversized_record_is_rejected_without_write() {
        let dir = TempDir::new().unwrap();
        let mut config = small_config();
        config.max_record_bytes = 8;
        let wal = DiskWal::open(dir.path(), config).unwrap();
        let t = tenant("t1");
        let err = wal.append(&t, &[0u8; 9]).unwrap_err();
        assert!(matches!(err, WalError::RecordTooLarge { .. }));
        let partition = wal.partition_for_key(&t);
        assert_eq!(wal.latest_position(partition).unwrap(), None);
    }
}
