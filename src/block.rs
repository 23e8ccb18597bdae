//! `.cidx` block I/O — LZ4-frame blocks with a JSON footer.
//!
//! # File layout
//!
//! ```text
//! Offset            Size  Field
//!    0                 4  magic "CIDX"
//!    4               var  LZ4 frame-compressed blocks, back to back;
//!                         each decompresses to a whole number of records
//!  footer_start      var  uncompressed JSON array of block descriptors
//!  end-8               8  footer length, u64 BE
//! ```
//!
//! Block descriptors are ordered by `startKey` ascending.  A key never
//! straddles a block boundary except that duplicates of a block's last key
//! may continue at the head of the next block — the reader walks forward
//! while `startKey` still admits the target.
//!
//! The reader validates everything reachable without decompression up front:
//! magic, footer length range, descriptor offsets against the data region.
//! Per-block validation (decompressed size, record count) happens on read.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::record::{self, IndexRecord, RECORD_LEN};

/// On-disk magic at offset 0 of every `.cidx` file.
pub const INDEX_MAGIC: &[u8; 4] = b"CIDX";

/// Default records per block.
pub const DEFAULT_BLOCK_RECORDS: usize = 1024;
/// Target compressed size per block; the writer adapts the record count
/// toward it.
pub const TARGET_BLOCK_BYTES: usize = 16 * 1024;

// ── Descriptor ───────────────────────────────────────────────────────────────

/// One entry in the JSON footer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDescriptor {
    /// First record's key, NUL-trimmed.
    pub start_key:    String,
    /// Byte offset of the compressed block in the file.
    pub offset:       u64,
    /// Compressed byte length.
    pub length:       u64,
    pub record_count: u64,
    /// True iff every key in the block is unique.
    pub is_distinct:  bool,
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Appends compressed blocks and accumulates the footer.
///
/// The caller feeds whole sorted blocks; `finish` writes the footer and the
/// trailing length.  Atomic replacement (tmp + rename) is the indexer's job.
pub struct BlockWriter<W: Write> {
    writer: W,
    pos:    u64,
    blocks: Vec<BlockDescriptor>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        writer.write_all(INDEX_MAGIC)?;
        Ok(Self { writer, pos: INDEX_MAGIC.len() as u64, blocks: Vec::new() })
    }

    /// Compress and append one block of sorted records.
    pub fn write_block(&mut self, records: &[IndexRecord]) -> Result<&BlockDescriptor> {
        debug_assert!(!records.is_empty());
        debug_assert!(records.windows(2).all(|w| w[0] <= w[1]));

        let raw = record::encode_all(records);
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
        enc.write_all(&raw)?;
        let compressed = enc
            .finish()
            .map_err(|e| Error::Internal(format!("lz4 frame finish: {e}")))?;

        let is_distinct = records
            .windows(2)
            .all(|w| w[0].key != w[1].key);

        self.writer.write_all(&compressed)?;
        let desc = BlockDescriptor {
            start_key:    String::from_utf8_lossy(records[0].key_trimmed()).into_owned(),
            offset:       self.pos,
            length:       compressed.len() as u64,
            record_count: records.len() as u64,
            is_distinct,
        };
        self.pos += compressed.len() as u64;
        self.blocks.push(desc);
        Ok(self.blocks.last().unwrap())
    }

    /// Byte length of the last compressed block, for adaptive sizing.
    pub fn last_block_len(&self) -> Option<u64> {
        self.blocks.last().map(|b| b.length)
    }

    /// Write the JSON footer and the u64 BE length trailer, then flush.
    pub fn finish(mut self) -> Result<(W, Vec<BlockDescriptor>)> {
        let footer = serde_json::to_vec(&self.blocks)
            .map_err(|e| Error::Internal(format!("footer encode: {e}")))?;
        self.writer.write_all(&footer)?;
        self.writer.write_all(&(footer.len() as u64).to_be_bytes())?;
        self.writer.flush()?;
        Ok((self.writer, self.blocks))
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Read-only view of a `.cidx` file.
///
/// The footer is parsed once at open; block reads go through `pread` so a
/// shared reference can serve concurrent handlers.
#[derive(Debug)]
pub struct IndexReader {
    file:   File,
    blocks: Vec<BlockDescriptor>,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        // Smallest valid file: magic + empty-array footer + trailer.
        if file_len < (INDEX_MAGIC.len() + 2 + 8) as u64 {
            return Err(Error::CorruptIndex(format!(
                "file is {file_len} bytes, too short for a footer"
            )));
        }

        let mut magic = [0u8; 4];
        file.read_exact_at(&mut magic, 0)?;
        if &magic != INDEX_MAGIC {
            return Err(Error::CorruptIndex(format!(
                "bad magic {magic:02x?}, expected {INDEX_MAGIC:02x?}"
            )));
        }

        let mut trailer = [0u8; 8];
        file.read_exact_at(&mut trailer, file_len - 8)?;
        let footer_len = u64::from_be_bytes(trailer);
        if footer_len == 0 || footer_len > file_len - 8 - INDEX_MAGIC.len() as u64 {
            return Err(Error::CorruptIndex(format!(
                "footer length {footer_len} out of range for a {file_len}-byte file"
            )));
        }

        let footer_start = file_len - 8 - footer_len;
        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact_at(&mut footer, footer_start)?;
        let blocks: Vec<BlockDescriptor> = serde_json::from_slice(&footer)
            .map_err(|e| Error::CorruptIndex(format!("footer parse: {e}")))?;

        // Descriptor sanity: offsets ascend through the data region and
        // startKeys never decrease.
        let mut expected = INDEX_MAGIC.len() as u64;
        for (i, b) in blocks.iter().enumerate() {
            if b.offset != expected || b.offset + b.length > footer_start {
                return Err(Error::CorruptIndex(format!(
                    "block {i} spans {}..{} outside the data region",
                    b.offset,
                    b.offset + b.length
                )));
            }
            if b.record_count == 0 {
                return Err(Error::CorruptIndex(format!("block {i} is empty")));
            }
            if i > 0 && blocks[i - 1].start_key > b.start_key {
                return Err(Error::CorruptIndex(format!(
                    "block {i} startKey precedes its predecessor"
                )));
            }
            expected = b.offset + b.length;
        }

        Ok(Self { file, blocks })
    }

    pub fn blocks(&self) -> &[BlockDescriptor] {
        &self.blocks
    }

    pub fn total_records(&self) -> u64 {
        self.blocks.iter().map(|b| b.record_count).sum()
    }

    /// Index of the first block that could contain `key`.  A run of equal
    /// keys may begin in the block before the first `startKey == key` block,
    /// so this is one before the first block whose `startKey` ≥ key.
    pub fn seek_block(&self, key: &[u8]) -> usize {
        self.blocks
            .partition_point(|b| b.start_key.as_bytes() < key)
            .saturating_sub(1)
    }

    /// Read and decompress one block.
    pub fn read_block(&self, desc: &BlockDescriptor) -> Result<Vec<IndexRecord>> {
        let mut compressed = vec![0u8; desc.length as usize];
        self.file.read_exact_at(&mut compressed, desc.offset)?;

        let mut raw = Vec::with_capacity(desc.record_count as usize * RECORD_LEN);
        lz4_flex::frame::FrameDecoder::new(&compressed[..])
            .read_to_end(&mut raw)
            .map_err(|e| Error::CorruptIndex(format!("block decompression: {e}")))?;

        let records = record::decode_all(&raw)?;
        if records.len() as u64 != desc.record_count {
            return Err(Error::CorruptIndex(format!(
                "block at {} decoded {} records, descriptor says {}",
                desc.offset,
                records.len(),
                desc.record_count
            )));
        }
        Ok(records)
    }
}
