//! Locator index — an mmap-backed file mapping `file_id` (CRC32 of a
//! payload) to the chunk and byte offset where its block frame lives.
//!
//! # On-disk header layout (23 bytes, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      6   magic        "SILOSS"
//!    6      1   version      0x01
//!    7      8   max_offset   redundant size marker: count * 16   (BE i64)
//!   15      8   count        number of slots                    (BE i64)
//! ```
//!
//! followed by `count` packed 16-byte slots:
//!
//! ```text
//! Offset  Size  Field
//!    0      4   file_id      CRC32-IEEE of the block's payload   (BE u32)
//!    4      4   chunk_id     integer id of the owning chunk      (BE u32)
//!    8      8   offset       byte offset of the block frame      (BE i64)
//! ```
//!
//! The mapped region backs the durable slot store, but it is never written
//! to directly: every mutation goes through the file descriptor first, and
//! the mapping is re-established afterwards to cover the new length. This
//! keeps a single writer (the fd) as the source of truth for the header
//! counters rather than mutating mapped bytes in place for them. `find` is
//! a linear scan of an in-memory slot vector kept alongside the map —
//! acceptable at the scales this engine targets (see the crate's design
//! notes for the hash-map upgrade path, which would not change the file
//! format).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use memmap2::MmapMut;

use crate::error::{Result, StorageError};

pub const INDEX_MAGIC: &[u8; 6] = b"SILOSS";
pub const INDEX_FILE_VERSION: u8 = 0x01;
pub const INDEX_HEADER_SIZE: i64 = 23;
pub const INDEX_SLOT_SIZE: i64 = 16;

/// One locator: which chunk a block lives in, and at what offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSlot {
    pub file_id: u32,
    pub chunk_id: u32,
    pub offset: i64,
}

impl IndexSlot {
    fn encode(&self) -> [u8; INDEX_SLOT_SIZE as usize] {
        let mut buf = [0u8; INDEX_SLOT_SIZE as usize];
        let mut w: &mut [u8] = &mut buf;
        w.write_u32::<BigEndian>(self.file_id).expect("buffer is exactly sized");
        w.write_u32::<BigEndian>(self.chunk_id).expect("buffer is exactly sized");
        w.write_i64::<BigEndian>(self.offset).expect("buffer is exactly sized");
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        let file_id = buf.read_u32::<BigEndian>().map_err(|e| StorageError::io("slot decode", e))?;
        let chunk_id = buf.read_u32::<BigEndian>().map_err(|e| StorageError::io("slot decode", e))?;
        let offset = buf.read_i64::<BigEndian>().map_err(|e| StorageError::io("slot decode", e))?;
        Ok(IndexSlot { file_id, chunk_id, offset })
    }
}

struct IndexInner {
    file: File,
    map: MmapMut,
    count: i64,
    max_offset: i64,
    slots: Vec<IndexSlot>,
}

impl IndexInner {
    fn header_bytes(count: i64, max_offset: i64) -> [u8; INDEX_HEADER_SIZE as usize] {
        let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
        let mut w: &mut [u8] = &mut buf;
        w.write_all(INDEX_MAGIC).expect("buffer is exactly sized");
        w.write_u8(INDEX_FILE_VERSION).expect("buffer is exactly sized");
        w.write_i64::<BigEndian>(max_offset).expect("buffer is exactly sized");
        w.write_i64::<BigEndian>(count).expect("buffer is exactly sized");
        buf
    }

    /// Rewrite the header counters through the file descriptor — the sole
    /// writer of durable state. Callers re-map afterwards to pick up the
    /// change; the mapped bytes are never mutated in place.
    fn sync_header(&mut self) -> Result<()> {
        let bytes = Self::header_bytes(self.count, self.max_offset);
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::io("index header seek", e))?;
        self.file
            .write_all(&bytes)
            .map_err(|e| StorageError::io("index header rewrite", e))?;
        self.file.sync_data().map_err(|e| StorageError::io("index sync", e))?;
        Ok(())
    }

    fn remap(&mut self) -> Result<()> {
        self.map = unsafe { MmapMut::map_mut(&self.file).map_err(|e| StorageError::io("index mmap", e))? };
        Ok(())
    }
}

/// An mmap-backed locator index. Exclusive lock covers both the file/mapped
/// region and the in-memory slot vector during insert; lookups take the
/// lock for reading only.
pub struct Index {
    path: PathBuf,
    inner: RwLock<IndexInner>,
}

impl Index {
    /// Open an existing index file, or create a fresh one (empty header,
    /// zero slots) if it does not exist. The parent directory is created
    /// best-effort — see the crate's design notes on `makeDir` semantics.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }

        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StorageError::io("index open", e))?;

        if is_new {
            debug!("index: creating new index at {path:?}");
            let header = IndexInner::header_bytes(0, 0);
            file.write_all(&header)
                .map_err(|e| StorageError::io("index header write", e))?;
            file.sync_all().map_err(|e| StorageError::io("index sync", e))?;
        }

        let len = file
            .metadata()
            .map_err(|e| StorageError::io("index stat", e))?
            .len() as i64;
        if len < INDEX_HEADER_SIZE {
            return Err(StorageError::CorruptIndex {
                path: path.clone(),
                reason: format!("file length {len} is shorter than the {INDEX_HEADER_SIZE}-byte header"),
            });
        }

        file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io("index seek", e))?;
        let mut header_buf = [0u8; INDEX_HEADER_SIZE as usize];
        file.read_exact(&mut header_buf)
            .map_err(|e| StorageError::io("index header read", e))?;

        if &header_buf[0..6] != INDEX_MAGIC {
            return Err(StorageError::CorruptIndex {
                path: path.clone(),
                reason: "bad magic".into(),
            });
        }
        let version = header_buf[6];
        if version != INDEX_FILE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: path.clone(),
                expected: INDEX_FILE_VERSION,
                found: version,
            });
        }
        let mut r = &header_buf[7..];
        let _max_offset = r.read_i64::<BigEndian>().expect("slice is pre-checked");
        let count = r.read_i64::<BigEndian>().expect("slice is pre-checked");

        let slot_region = len - INDEX_HEADER_SIZE;
        if slot_region % INDEX_SLOT_SIZE != 0 {
            return Err(StorageError::CorruptIndex {
                path: path.clone(),
                reason: format!("slot region of {slot_region} bytes is not a multiple of {INDEX_SLOT_SIZE}"),
            });
        }

        let map = unsafe { MmapMut::map_mut(&file).map_err(|e| StorageError::io("index mmap", e))? };

        let slot_bytes = &map[INDEX_HEADER_SIZE as usize..];
        let parsed_count = slot_region / INDEX_SLOT_SIZE;
        let mut slots = Vec::with_capacity(parsed_count as usize);
        for i in 0..parsed_count {
            let start = (i * INDEX_SLOT_SIZE) as usize;
            let end = start + INDEX_SLOT_SIZE as usize;
            slots.push(IndexSlot::decode(&slot_bytes[start..end])?);
        }

        debug!("index: opened {path:?} with {} slots", slots.len());

        Ok(Index {
            path,
            inner: RwLock::new(IndexInner {
                file,
                map,
                count,
                max_offset: parsed_count * INDEX_SLOT_SIZE,
                slots,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> i64 {
        self.inner.read().expect("index lock poisoned").count
    }

    /// Append `slot` to the index, durably. Grows the file through the fd,
    /// rewrites the header counters through the fd, then re-maps to cover
    /// the new length.
    pub fn insert(&self, slot: IndexSlot) -> Result<()> {
        let mut guard = self.inner.write().expect("index lock poisoned");

        let write_at = INDEX_HEADER_SIZE + guard.count * INDEX_SLOT_SIZE;
        guard
            .file
            .seek(SeekFrom::Start(write_at as u64))
            .map_err(|e| StorageError::io("index seek", e))?;
        guard
            .file
            .write_all(&slot.encode())
            .map_err(|e| StorageError::io("index append", e))?;
        guard.file.sync_data().map_err(|e| StorageError::io("index sync", e))?;

        guard.count += 1;
        guard.max_offset += INDEX_SLOT_SIZE;
        guard.sync_header()?;
        guard.remap()?;
        guard.slots.push(slot);

        debug!(
            "index: inserted slot file_id={:#010x} chunk_id={} offset={} (count={})",
            slot.file_id, slot.chunk_id, slot.offset, guard.count
        );
        Ok(())
    }

    /// Linear scan for the first slot matching `file_id`. Duplicates do not
    /// occur under normal operation because the storage façade checks
    /// before every append.
    pub fn find(&self, file_id: u32) -> Option<IndexSlot> {
        let guard = self.inner.read().expect("index lock poisoned");
        guard.slots.iter().copied().find(|s| s.file_id == file_id)
    }

    /// Read-only snapshot of every slot currently in the index.
    pub fn slots(&self) -> Vec<IndexSlot> {
        self.inner.read().expect("index lock poisoned").slots.clone()
    }

    pub fn close(self) -> Result<()> {
        let guard = self.inner.into_inner().expect("index lock poisoned");
        guard.map.flush().map_err(|e| StorageError::io("index flush", e))?;
        drop(guard.file);
        Ok(())
    }

    /// Compaction/rebuild: scan every chunk in `chunk_dir`, replay block
    /// headers, and write a fresh index — optionally dropping
    /// `FLAG_DELETED` frames. Unimplemented in this core; present as a
    /// placeholder for the out-of-band recovery routine.
    pub fn rebuild(_chunk_dir: &Path) -> Result<Self> {
        Err(StorageError::NotImplemented("index rebuild"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_index_is_empty() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path().join("index")).unwrap();
        assert_eq!(index.count(), 0);
        assert!(index.slots().is_empty());
    }

    #[test]
    fn insert_then_find_round_trips() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path().join("index")).unwrap();
        let slot = IndexSlot { file_id: 0x1234, chunk_id: 1, offset: 40 };
        index.insert(slot).unwrap();

        assert_eq!(index.count(), 1);
        assert_eq!(index.find(0x1234), Some(slot));
        assert_eq!(index.find(0xdead), None);
    }

    #[test]
    fn reopen_preserves_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let index = Index::open(&path).unwrap();
            index.insert(IndexSlot { file_id: 1, chunk_id: 1, offset: 40 }).unwrap();
            index.insert(IndexSlot { file_id: 2, chunk_id: 1, offset: 80 }).unwrap();
        }
        let reopened = Index::open(&path).unwrap();
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.find(2).unwrap().offset, 80);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, b"NOTANINDEXHEADERBYTES!!").unwrap();
        let err = Index::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::CorruptIndex { .. }));
    }

    #[test]
    fn rebuild_is_not_implemented() {
        let dir = tempdir().unwrap();
        let err = Index::rebuild(dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::NotImplemented(_)));
    }

    #[test]
    fn rejects_truncated_slot_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let index = Index::open(&path).unwrap();
            index.insert(IndexSlot { file_id: 1, chunk_id: 1, offset: 40 }).unwrap();
        }
        // Truncate one byte off the single 16-byte slot.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((INDEX_HEADER_SIZE + INDEX_SLOT_SIZE - 1) as u64).unwrap();
        let err = Index::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::CorruptIndex { .. }));
    }
}
