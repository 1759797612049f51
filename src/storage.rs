//! Storage façade — the primary embedding surface.
//!
//! Combines the [`chunk`](crate::chunk) and [`index`](crate::index) layers:
//! storing a payload is a dedup check, an append to the active chunk, and an
//! index insert; reading is an index lookup followed by a chunk read.
//! Segment rollover and chunk-handle caching both live here; neither the
//! chunk manager nor the index know about either concern.
//!
//! ```no_run
//! use silcas::storage::{Storage, StorageConfig};
//!
//! let mut store = Storage::open(StorageConfig::default())?;
//! store.store("hello.txt", b"hello", silcas::block::FLAG_ID_CRC32)?;
//! let (name, payload) = store.read(silcas::block::crc32_of(b"hello"))?;
//! assert_eq!(payload, b"hello");
//! # Ok::<(), silcas::error::StorageError>(())
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::info;

use crate::block::{self, BlockMeta};
use crate::chunk::Chunk;
use crate::error::{Result, StorageError};
use crate::index::{Index, IndexSlot};

/// Default segment size limit: 2 GiB.
pub const DEFAULT_SEGMENT_SIZE_LIMIT: i64 = 2 * 1024 * 1024 * 1024;

/// Configuration for [`Storage::open`]. Plain data — no env/file parsing
/// surface lives here; that belongs to a caller-provided CLI or service
/// layer outside this core.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub active_chunk_path: PathBuf,
    pub index_path: PathBuf,
    pub segment_size_limit: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            active_chunk_path: PathBuf::from("/tmp/chunk/1.chunk"),
            index_path: PathBuf::from("/tmp/index"),
            segment_size_limit: DEFAULT_SEGMENT_SIZE_LIMIT,
        }
    }
}

/// Combines a chunk cache and a locator index into one content-addressed
/// store. Reads resolve a chunk handle from the cache (opening and caching
/// it on first use); writes always land in the active chunk, rolling to a
/// fresh one when the active segment reaches `segment_size_limit`.
pub struct Storage {
    index: Index,
    segment_size_limit: i64,
    chunk_dir: PathBuf,
    active_id: Mutex<u32>,
    chunks: Mutex<HashMap<u32, Chunk>>,
}

impl Storage {
    /// Open the index, open (or create) the active chunk, and seed the
    /// chunk cache with it.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let index = Index::open(&config.index_path)?;
        let active = Chunk::open(&config.active_chunk_path)?;
        let active_id = active.id();
        let chunk_dir = config
            .active_chunk_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut chunks = HashMap::new();
        chunks.insert(active_id, active);

        Ok(Storage {
            index,
            segment_size_limit: config.segment_size_limit,
            chunk_dir,
            active_id: Mutex::new(active_id),
            chunks: Mutex::new(chunks),
        })
    }

    fn chunk_path(&self, id: u32) -> PathBuf {
        self.chunk_dir.join(format!("{id}.chunk"))
    }

    /// Content-address, dedup-check, and persist `payload`. Returns
    /// `DuplicateObject` without writing if a slot for this payload's CRC32
    /// already exists.
    pub fn store(&self, name: &str, payload: &[u8], flags: u8) -> Result<u32> {
        let fid = block::crc32_of(payload);
        if self.index.find(fid).is_some() {
            return Err(StorageError::DuplicateObject(fid));
        }

        let mut chunks = self.chunks.lock().expect("chunk map lock poisoned");
        let mut active_id = self.active_id.lock().expect("active id lock poisoned");

        let current_max_offset = chunks
            .get(&*active_id)
            .expect("active chunk is always present in the map")
            .max_offset();

        if current_max_offset >= self.segment_size_limit {
            let next_id = *active_id + 1;
            let next_path = self.chunk_path(next_id);
            info!("storage: rolling segment {active_id} -> {next_id} at {next_path:?}");
            let next_chunk = Chunk::open(next_path)?;
            chunks.insert(next_id, next_chunk);
            *active_id = next_id;
        }

        let active = chunks.get(&*active_id).expect("active chunk is always present in the map");
        let offset = active.append(name, flags, payload)?;

        self.index.insert(IndexSlot { file_id: fid, chunk_id: *active_id, offset })?;
        Ok(fid)
    }

    /// Resolve the chunk handle for `chunk_id`, opening and caching it on
    /// demand if it isn't already present.
    fn resolve_chunk<'a>(
        &self,
        chunks: &'a mut HashMap<u32, Chunk>,
        chunk_id: u32,
    ) -> Result<()> {
        if chunks.contains_key(&chunk_id) {
            return Ok(());
        }
        let chunk = Chunk::open(self.chunk_path(chunk_id))?;
        chunks.insert(chunk_id, chunk);
        Ok(())
    }

    /// Look up `fid`, resolve its chunk, and fully decode its block.
    pub fn read(&self, fid: u32) -> Result<(String, Vec<u8>)> {
        let slot = self.index.find(fid).ok_or(StorageError::NotFound(fid))?;

        let mut chunks = self.chunks.lock().expect("chunk map lock poisoned");
        self.resolve_chunk(&mut chunks, slot.chunk_id)?;
        let chunk = chunks.get(&slot.chunk_id).expect("just resolved");

        let block = chunk.read_at(slot.offset)?;
        Ok((block.name, block.payload))
    }

    /// Look up `fid`, resolve its chunk, and stream its payload into `sink`
    /// without buffering the whole block in memory. Returns the block's
    /// metadata.
    pub fn transfer<W: Write>(&self, fid: u32, sink: &mut W) -> Result<BlockMeta> {
        let slot = self.index.find(fid).ok_or(StorageError::NotFound(fid))?;

        let mut chunks = self.chunks.lock().expect("chunk map lock poisoned");
        self.resolve_chunk(&mut chunks, slot.chunk_id)?;
        let chunk = chunks.get(&slot.chunk_id).expect("just resolved");

        chunk.transfer_at(slot.offset, sink)
    }

    pub fn index_slot_count(&self) -> i64 {
        self.index.count()
    }

    pub fn close(self) -> Result<()> {
        self.index.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> StorageConfig {
        StorageConfig {
            active_chunk_path: dir.join("chunk/1.chunk"),
            index_path: dir.join("index"),
            segment_size_limit: DEFAULT_SEGMENT_SIZE_LIMIT,
        }
    }

    #[test]
    fn store_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = Storage::open(config_in(dir.path())).unwrap();

        let fid = store.store("hello.txt", b"hello", block::FLAG_ID_CRC32).unwrap();
        assert_eq!(fid, 0x3610_A686);

        let (name, payload) = store.read(fid).unwrap();
        assert_eq!(name, "hello.txt");
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn empty_payload_round_trips_with_zero_crc() {
        let dir = tempdir().unwrap();
        let store = Storage::open(config_in(dir.path())).unwrap();

        let fid = store.store("a", b"", block::FLAG_ID_CRC32).unwrap();
        assert_eq!(fid, 0);

        let (name, payload) = store.read(0).unwrap();
        assert_eq!(name, "a");
        assert_eq!(payload, b"");
    }

    #[test]
    fn duplicate_store_is_rejected_and_leaves_chunk_unchanged() {
        let dir = tempdir().unwrap();
        let store = Storage::open(config_in(dir.path())).unwrap();

        store.store("n", b"payload", block::FLAG_NONE).unwrap();
        let before = std::fs::read(dir.path().join("chunk/1.chunk")).unwrap();

        let err = store.store("n", b"payload", block::FLAG_NONE).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateObject(_)));

        let after = std::fs::read(dir.path().join("chunk/1.chunk")).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.index_slot_count(), 1);
    }

    #[test]
    fn missing_file_id_is_not_found() {
        let dir = tempdir().unwrap();
        let store = Storage::open(config_in(dir.path())).unwrap();
        assert!(matches!(store.read(0xdead_beef), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn rollover_opens_next_chunk_and_both_remain_readable() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            segment_size_limit: 4096,
            ..config_in(dir.path())
        };
        let store = Storage::open(config).unwrap();

        let mut fids = Vec::new();
        for i in 0..8u32 {
            let payload = vec![i as u8; 1024];
            fids.push(store.store(&format!("obj-{i}"), &payload, block::FLAG_NONE).unwrap());
        }

        assert!(dir.path().join("chunk/2.chunk").exists());

        for (i, fid) in fids.into_iter().enumerate() {
            let (name, payload) = store.read(fid).unwrap();
            assert_eq!(name, format!("obj-{i}"));
            assert_eq!(payload, vec![i as u8; 1024]);
        }
    }

    #[test]
    fn transfer_streams_payload_without_full_decode() {
        let dir = tempdir().unwrap();
        let store = Storage::open(config_in(dir.path())).unwrap();
        let fid = store.store("big", b"streamed", block::FLAG_NONE).unwrap();

        let mut sink = Vec::new();
        let meta = store.transfer(fid, &mut sink).unwrap();
        assert_eq!(meta.name, "big");
        assert_eq!(sink, b"streamed");
    }

    #[test]
    fn restart_preserves_all_stored_objects() {
        let dir = tempdir().unwrap();
        let fid_a;
        let fid_b;
        {
            let store = Storage::open(config_in(dir.path())).unwrap();
            fid_a = store.store("a", b"alpha", block::FLAG_NONE).unwrap();
            fid_b = store.store("b", b"bravo", block::FLAG_NONE).unwrap();
            store.close().unwrap();
        }

        let reopened = Storage::open(config_in(dir.path())).unwrap();
        assert_eq!(reopened.read(fid_a).unwrap(), ("a".to_string(), b"alpha".to_vec()));
        assert_eq!(reopened.read(fid_b).unwrap(), ("b".to_string(), b"bravo".to_vec()));
        assert_eq!(reopened.index_slot_count(), 2);
    }
}
