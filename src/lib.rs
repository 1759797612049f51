//! # silcas — append-only, segmented, content-addressed blob store
//!
//! Format guarantees:
//! - All multi-byte fields in every on-disk format are big-endian; never
//!   negotiated.
//! - Every stored object is content-addressed by the CRC32-IEEE of its
//!   payload; that value is both the dedup key and the lookup key.
//! - A chunk's header is rewritten only after its data has been written, so
//!   a crash mid-append is visible as undercounted trailing bytes rather
//!   than a header that claims a block that was never fully persisted.
//! - The index is mmap-backed; lookups never touch the filesystem once
//!   the slot vector has been parsed at open.
//! - There is no in-place update and no compaction in this core — see
//!   [`index::Index::rebuild`].

pub mod block;
pub mod chunk;
pub mod error;
pub mod index;
pub mod storage;

pub use block::{Block, BlockMeta, FLAG_DELETED, FLAG_EXECUTABLE, FLAG_ID_CRC32, FLAG_ID_MD5,
                FLAG_NONE, FLAG_PRIVATE};
pub use chunk::Chunk;
pub use error::{Result, StorageError};
pub use index::{Index, IndexSlot};
pub use storage::{Storage, StorageConfig};
