//! Index record codec — fixed 80 bytes on disk.
//!
//! # On-disk layout (80 bytes, numeric fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0     64   key     byte sequence, right-padded with NULs; truncated if longer
//!   64      8   offset  i64 BE — byte offset of the record in the source file
//!   72      8   line    i64 BE — 1-based line number in the source file
//! ```
//!
//! Records compare lexicographically by the full 64-byte key; ties break by
//! offset ascending.  NUL padding sorts before every other byte, so short
//! keys order before their extensions, matching byte-wise string order.

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Byte length of the key field.
pub const KEY_LEN: usize = 64;
/// Fixed on-disk size of one record.
pub const RECORD_LEN: usize = 80;

/// Byte joining column values in a composite key.
pub const COMPOSITE_SEP: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub key:    [u8; KEY_LEN],
    pub offset: i64,
    pub line:   i64,
}

impl IndexRecord {
    /// Build a record from raw key bytes, truncating or NUL-padding to 64.
    pub fn new(key: &[u8], offset: i64, line: i64) -> Self {
        let mut k = [0u8; KEY_LEN];
        let n = key.len().min(KEY_LEN);
        k[..n].copy_from_slice(&key[..n]);
        Self { key: k, offset, line }
    }

    /// The key with trailing NUL padding removed.
    pub fn key_trimmed(&self) -> &[u8] {
        let end = self
            .key
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        &self.key[..end]
    }

    /// Encode into an 80-byte buffer.
    pub fn encode_into(&self, buf: &mut [u8; RECORD_LEN]) {
        buf[..KEY_LEN].copy_from_slice(&self.key);
        BigEndian::write_i64(&mut buf[KEY_LEN..KEY_LEN + 8], self.offset);
        BigEndian::write_i64(&mut buf[KEY_LEN + 8..RECORD_LEN], self.line);
    }

    /// Decode from an 80-byte buffer.
    pub fn decode_from(buf: &[u8; RECORD_LEN]) -> Self {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[..KEY_LEN]);
        Self {
            key,
            offset: BigEndian::read_i64(&buf[KEY_LEN..KEY_LEN + 8]),
            line:   BigEndian::read_i64(&buf[KEY_LEN + 8..RECORD_LEN]),
        }
    }
}

impl Ord for IndexRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for IndexRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── Bulk codec ───────────────────────────────────────────────────────────────

/// Encode `records` into one contiguous allocation.
pub fn encode_all(records: &[IndexRecord]) -> Vec<u8> {
    let mut out = vec![0u8; records.len() * RECORD_LEN];
    for (i, rec) in records.iter().enumerate() {
        let chunk: &mut [u8; RECORD_LEN] = (&mut out[i * RECORD_LEN..(i + 1) * RECORD_LEN])
            .try_into()
            .unwrap();
        rec.encode_into(chunk);
    }
    out
}

/// Decode a buffer of concatenated records.
///
/// The buffer must be a whole number of records; anything else means the
/// block was decompressed from a damaged file.
pub fn decode_all(buf: &[u8]) -> Result<Vec<IndexRecord>> {
    if buf.len() % RECORD_LEN != 0 {
        return Err(Error::CorruptIndex(format!(
            "block size {} is not a multiple of the {RECORD_LEN}-byte record",
            buf.len()
        )));
    }
    Ok(buf
        .chunks_exact(RECORD_LEN)
        .map(|c| IndexRecord::decode_from(c.try_into().unwrap()))
        .collect())
}
