//! Memory-mapped source file access.
//!
//! The engine never writes the source.  One `Source` owns a shared read-only
//! mapping; the indexer's workers and every query handler borrow slices of
//! it.  Cloning is cheap (the map is reference-counted) and the last clone
//! dropped releases the mapping.
//!
//! Records are newline-terminated; the field separator is configurable per
//! call.  A record's byte length includes its terminating newline, matching
//! the `offset,length` lines the executor emits.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// Record terminator.
pub const RECORD_SEP: u8 = b'\n';

/// Bytes of the file head covered by the fingerprint.
const FINGERPRINT_HEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct Source {
    path: PathBuf,
    map:  Option<Arc<Mmap>>,
    len:  u64,
}

impl Source {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::SourceMissing(path.to_owned()));
        }
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // A zero-length file cannot be mapped; expose it as an empty slice.
        let map = if len > 0 {
            // Safety: read-only map; the engine never truncates the source,
            // and appends past the mapped length are invisible to this view.
            Some(Arc::new(unsafe { Mmap::map(&file)? }))
        } else {
            None
        };
        Ok(Self { path: path.to_owned(), map, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        self.map.as_deref().map_or(&[], |m| &m[..])
    }

    /// Modification time at open, in whole seconds since the epoch.
    pub fn mtime_secs(&self) -> Result<i64> {
        let meta = std::fs::metadata(&self.path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Internal(format!("mtime before epoch: {e}")))?;
        Ok(mtime.as_secs() as i64)
    }

    /// Cheap stable digest: CRC32 of the first 64 KiB joined with the size.
    pub fn fingerprint(&self) -> String {
        let data = self.data();
        let head = &data[..data.len().min(FINGERPRINT_HEAD)];
        format!("{}-{}", hex::encode(crc32fast::hash(head).to_be_bytes()), self.len)
    }

    /// The record starting at `offset`: its bytes (terminator included) and
    /// length.  `None` when `offset` is at or past end-of-file.
    pub fn record_at(&self, offset: u64) -> Option<(&[u8], u64)> {
        let data = self.data();
        if offset >= data.len() as u64 {
            return None;
        }
        let rest = &data[offset as usize..];
        let len = match memchr::memchr(RECORD_SEP, rest) {
            Some(i) => i + 1,
            None => rest.len(),
        };
        Some((&rest[..len], len as u64))
    }

    /// Iterate `(offset, record)` pairs from `start` to end-of-file.
    pub fn records_from(&self, start: u64) -> RecordIter<'_> {
        RecordIter { data: self.data(), pos: start as usize }
    }

    /// Parse the header record into column names.
    pub fn header_columns(&self, sep: u8) -> Result<Vec<String>> {
        let (record, _) = self
            .record_at(0)
            .ok_or_else(|| Error::CorruptIndex("source has no header record".into()))?;
        Ok(split_fields(record, sep)
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect())
    }

    /// Byte offset of the first data record (the byte after the header).
    pub fn data_start(&self) -> u64 {
        self.record_at(0).map_or(0, |(_, len)| len)
    }
}

pub struct RecordIter<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let offset = self.pos;
        let rest = &self.data[self.pos..];
        let len = match memchr::memchr(RECORD_SEP, rest) {
            Some(i) => i + 1,
            None => rest.len(),
        };
        self.pos += len;
        Some((offset as u64, &rest[..len]))
    }
}

// ── Field access ─────────────────────────────────────────────────────────────

/// Strip the record terminator (and a preceding CR, if any).
pub fn trim_record(record: &[u8]) -> &[u8] {
    let mut r = record;
    if r.last() == Some(&RECORD_SEP) {
        r = &r[..r.len() - 1];
    }
    if r.last() == Some(&b'\r') {
        r = &r[..r.len() - 1];
    }
    r
}

/// Split a record into field slices.
pub fn split_fields(record: &[u8], sep: u8) -> Vec<&[u8]> {
    trim_record(record).split(move |&b| b == sep).collect()
}

/// The `idx`-th field of a record, without materializing the others.
pub fn field_at(record: &[u8], sep: u8, idx: usize) -> Option<&[u8]> {
    let body = trim_record(record);
    let mut start = 0usize;
    let mut field = 0usize;
    for pos in memchr::memchr_iter(sep, body) {
        if field == idx {
            return Some(&body[start..pos]);
        }
        start = pos + 1;
        field += 1;
    }
    (field == idx).then(|| &body[start..])
}
