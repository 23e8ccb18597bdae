//! Engine error kinds.
//!
//! Every error carries a stable kind string that is surfaced verbatim on the
//! wire as `ERR <Kind>: <msg>`.  Kinds are part of the protocol; messages are
//! diagnostics only and may change between releases.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error reading source: {0}")]
    SourceIo(#[from] io::Error),
    #[error("Source file not found: {0}")]
    SourceMissing(PathBuf),
    /// Advisory in the query path, fatal in the index path without `--force`.
    #[error("Source changed since index capture: {0}")]
    SourceStale(String),
    #[error("Column not present in header: {0}")]
    UnknownColumn(String),
    /// Recoverable inside the indexer: the row is skipped and counted.
    #[error("Malformed row at line {line}")]
    MalformedRow { line: u64 },
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),
    /// Advisory; the executor falls back to a full scan unless `--strict`.
    #[error("No usable index for predicate: {0}")]
    NoUsableIndex(String),
    #[error("Spill file could not be written: {0}")]
    SpillFull(String),
    #[error("Out of disk space while writing index")]
    OutOfSpace,
    #[error("Query exceeded its deadline")]
    Deadline,
    #[error("Query canceled")]
    Canceled,
    #[error("Malformed request: {0}")]
    Protocol(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable wire identifier for this kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceIo(_)      => "SourceIO",
            Error::SourceMissing(_) => "SourceMissing",
            Error::SourceStale(_)   => "SourceStale",
            Error::UnknownColumn(_) => "UnknownColumn",
            Error::MalformedRow { .. } => "MalformedRow",
            Error::CorruptIndex(_)  => "CorruptIndex",
            Error::NoUsableIndex(_) => "NoUsableIndex",
            Error::SpillFull(_)     => "SpillFull",
            Error::OutOfSpace       => "OutOfSpace",
            Error::Deadline         => "Deadline",
            Error::Canceled         => "Canceled",
            Error::Protocol(_)      => "ProtocolError",
            Error::Internal(_)      => "InternalError",
        }
    }

    /// The `ERR <Kind>: <msg>` line that closes a failed response.
    pub fn wire_line(&self) -> String {
        format!("ERR {}: {self}", self.kind())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
