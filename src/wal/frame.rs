//! Record framing for the disk log (magic + lengths + crc32c).
//!
//! Frame layout:
//! ```text
//! [magic u32 le][payload_len u32 le][crc32c u32 le]
//! [key_len u16 le][key bytes][record bytes]
//! ```
//! The crc covers everything after the 12-byte header. A short read at
//! the tail of the active segment is not an error; it is an append in
//! progress (or a torn write at crash) and reads stop there.

use std::io::{Read, Write};

use crc32c::crc32c;

use super::WalError;

const FRAME_MAGIC: u32 = 0x4544_5731; // "EDW1"
const FRAME_HEADER_LEN: usize = 12;

pub struct FramedRecord {
    pub key: String,
    pub value: Vec<u8>,
}

pub fn encode_frame(key: &str, value: &[u8], max_record_bytes: usize) -> Result<Vec<u8>, WalError> {
    if value.len() > max_record_bytes {
        return Err(WalError::RecordTooLarge {
            max_bytes: max_record_bytes,
            got_bytes: value.len(),
        });
    }
    let key_len = u16::try_from(key.len()).map_err(|_| WalError::Corrupt {
        reason: "partition key exceeds u16 length".to_string(),
    })?;

    let mut payload = Vec::with_capacity(2 + key.len() + value.len());
    payload.extend_from_slice(&key_len.to_le_bytes());
    payload.extend_from_slice(key.as_bytes());
    payload.extend_from_slice(value);

    let crc = crc32c(&payload);
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub struct FrameReader<R> {
    reader: R,
    max_record_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_record_bytes: usize) -> Self {
        Self {
            reader,
            max_record_bytes,
        }
    }

    /// Read the next complete frame. `Ok(None)` on clean EOF or a
    /// partial frame at the tail.
    pub fn read_next(&mut self) -> Result<Option<FramedRecord>, WalError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !read_fully(&mut self.reader, &mut header)? {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FRAME_MAGIC {
            return Err(WalError::Corrupt {
                reason: format!("frame magic mismatch: got {magic:#x}"),
            });
        }
        let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if payload_len < 2 {
            return Err(WalError::Corrupt {
                reason: "frame payload too short for key length".to_string(),
            });
        }
        // key_len(2) + value; the value bound is what the broker enforces.
        if payload_len > self.max_record_bytes + 2 + u16::MAX as usize {
            return Err(WalError::RecordTooLarge {
                max_bytes: self.max_record_bytes,
                got_bytes: payload_len,
            });
        }
        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        let mut payload = vec![0u8; payload_len];
        if !read_fully(&mut self.reader, &mut payload)? {
            return Ok(None);
        }

        let actual_crc = crc32c(&payload);
        if actual_crc != expected_crc {
            return Err(WalError::Corrupt {
                reason: format!("frame crc mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"),
            });
        }

        let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        if 2 + key_len > payload.len() {
            return Err(WalError::Corrupt {
                reason: "frame key length exceeds payload".to_string(),
            });
        }
        let key = String::from_utf8(payload[2..2 + key_len].to_vec()).map_err(|_| {
            WalError::Corrupt {
                reason: "frame key is not utf-8".to_string(),
            }
        })?;
        let value = payload[2 + key_len..].to_vec();
        Ok(Some(FramedRecord { key, value }))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_record_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_record_bytes: usize) -> Self {
        Self {
            writer,
            max_record_bytes,
        }
    }

    /// Write one frame; returns the frame's length in bytes.
    pub fn write_record(&mut self, key: &str, value: &[u8]) -> Result<usize, WalError> {
        let frame = encode_frame(key, value, self.max_record_bytes)?;
        self.writer.write_all(&frame).map_err(WalError::io_none)?;
        Ok(frame.len())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, WalError> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..]).map_err(WalError::io_none)?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(true)
}
