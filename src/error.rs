//! Error taxonomy shared by the block codec, chunk manager, index, and the
//! storage façade.
//!
//! Every fallible operation in this crate returns `Result<T, StorageError>`.
//! There is no retry logic anywhere in the core — a caller that wants one
//! builds it on top of this error type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Chunk header magic mismatch, a short read while parsing it, or a
    /// block frame that could not be decoded at its expected offset.
    #[error("corrupt chunk file {path:?}: {reason}")]
    CorruptChunk { path: PathBuf, reason: String },

    /// Index header magic mismatch, or the slot region is not an exact
    /// multiple of the slot size.
    #[error("corrupt index file {path:?}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    /// The version byte in a chunk or index header is not one this build
    /// knows how to read.
    #[error("unsupported format version {found} in {path:?} (expected {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        expected: u8,
        found: u8,
    },

    /// A chunk file's basename has no valid integer prefix before the
    /// final ".".
    #[error("chunk file name {0:?} has no numeric id prefix")]
    InvalidChunkName(PathBuf),

    /// A block name was empty or longer than 255 bytes.
    #[error("invalid block name (len={0}, must be 1..=255)")]
    InvalidName(usize),

    /// A read ran out of bytes before a declared field could be filled.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    /// `store` was called with a payload whose file_id already has a slot
    /// in the index.
    #[error("duplicate object (file_id={0:#010x})")]
    DuplicateObject(u32),

    /// Lookup by file_id found no index slot.
    #[error("object not found (file_id={0:#010x})")]
    NotFound(u32),

    /// The index compaction/rebuild path. Always returned, never
    /// implemented in this core.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Any underlying file or mmap failure, tagged with the operation that
    /// triggered it.
    #[error("io error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        StorageError::Io { op, source }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
