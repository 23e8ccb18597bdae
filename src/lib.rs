#![feature(unix_socket_peek)]
//! # csvquery — sorted block-compressed indexes for huge delimited files
//!
//! Format guarantees (frozen in v1):
//! - Index records are fixed 80 bytes: 64-byte NUL-padded key, i64 BE byte
//!   offset, i64 BE 1-based line number
//! - Records sort lexicographically by key; ties break by offset ascending
//! - A `.cidx` file is `CIDX` magic, LZ4-frame blocks (each a whole number
//!   of records), an uncompressed JSON footer, and a trailing u64 BE footer
//!   length — the footer is always reachable from end-of-file
//! - Block `startKey`s are strictly non-decreasing; duplicates of a block's
//!   last key may continue at the head of the next block
//! - The `.bloom` sidecar is a 24-byte BE header plus the bit array, and is
//!   bit-for-bit reproducible for a given insertion order and (n, p)
//! - Index, bloom, and meta files for one `(csv, column)` triple share the
//!   source fingerprint or the triple is treated as absent
//! - The source file is never written by the engine

pub mod error;
pub mod scan;
pub mod record;
pub mod block;
pub mod bloom;
pub mod source;
pub mod meta;
pub mod schema;
pub mod indexer;
pub mod predicate;
pub mod planner;
pub mod executor;
pub mod daemon;

// Flat re-exports for the most common types.
pub use error::Error;
pub use record::{IndexRecord, KEY_LEN, RECORD_LEN};
pub use block::{BlockDescriptor, BlockWriter, IndexReader, INDEX_MAGIC};
pub use bloom::{Bloom, BloomMap};
pub use source::Source;
pub use meta::{ColumnStats, IndexMeta};
pub use indexer::{IndexOptions, IndexReport, Indexer};
pub use predicate::{CmpOp, Predicate};
pub use executor::{Engine, QueryRequest, QueryResult};
