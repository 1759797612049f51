//! Chunk (segment) file — an append-only sequence of block frames, capped
//! at a configurable byte limit and fronted by a 40-byte header.
//!
//! # On-disk header layout (40 bytes, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      7   magic       "SILOSSC"
//!    7      1   version     0x01
//!    8      8   count       number of blocks appended so far  (BE i64)
//!   16      8   total_bytes sum of appended block frame sizes (BE i64)
//!   24      8   created_at  Unix seconds, chunk creation time (BE i64)
//!   32      8   max_offset  end of the last written block     (BE i64)
//! ```
//!
//! `max_offset` starts at 40 (the header's own size) on a freshly created
//! chunk and grows by each appended block's `on_disk_size()`.
//!
//! A chunk is identified by an integer id taken from its file's basename:
//! everything before the final `.` must parse as a non-negative integer
//! (`"17.chunk"` -> `17`). [`Chunk::id_from_path`] performs this parse.
//!
//! Appending rewrites the header after the new block's bytes have been
//! written, mirroring the append-then-fixup pattern: data loss on a crash
//! mid-append leaves a chunk whose header undercounts its tail, not one
//! that overclaims a block that was never fully written.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::block::{self, Block, BlockMeta};
use crate::error::{Result, StorageError};

pub const CHUNK_MAGIC: &[u8; 7] = b"SILOSSC";
pub const CHUNK_FILE_VERSION: u8 = 0x01;
pub const CHUNK_HEADER_SIZE: i64 = 40;

/// Fixed-size header fields kept in memory and flushed to disk after each
/// append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkHeader {
    count: i64,
    total_bytes: i64,
    created_at: i64,
    max_offset: i64,
}

impl ChunkHeader {
    fn fresh() -> Self {
        ChunkHeader {
            count: 0,
            total_bytes: 0,
            created_at: now_unix(),
            max_offset: CHUNK_HEADER_SIZE,
        }
    }

    fn encode(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        let mut w: &mut [u8] = &mut buf;
        w.write_all(CHUNK_MAGIC).expect("buffer is exactly sized");
        w.write_u8(CHUNK_FILE_VERSION).expect("buffer is exactly sized");
        w.write_i64::<BigEndian>(self.count).expect("buffer is exactly sized");
        w.write_i64::<BigEndian>(self.total_bytes).expect("buffer is exactly sized");
        w.write_i64::<BigEndian>(self.created_at).expect("buffer is exactly sized");
        w.write_i64::<BigEndian>(self.max_offset).expect("buffer is exactly sized");
        buf
    }

    fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if &buf[0..7] != CHUNK_MAGIC {
            return Err(StorageError::CorruptChunk {
                path: path.to_path_buf(),
                reason: "bad magic".into(),
            });
        }
        let version = buf[7];
        if version != CHUNK_FILE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: path.to_path_buf(),
                expected: CHUNK_FILE_VERSION,
                found: version,
            });
        }
        let mut r = &buf[8..];
        let count = r.read_i64::<BigEndian>().expect("slice is pre-checked");
        let total_bytes = r.read_i64::<BigEndian>().expect("slice is pre-checked");
        let created_at = r.read_i64::<BigEndian>().expect("slice is pre-checked");
        let max_offset = r.read_i64::<BigEndian>().expect("slice is pre-checked");
        Ok(ChunkHeader {
            count,
            total_bytes,
            created_at,
            max_offset,
        })
    }
}

/// A single append-only segment file, guarded by an exclusive lock so
/// concurrent `append`/`read_at` calls on the same chunk serialize.
pub struct Chunk {
    id: u32,
    path: PathBuf,
    inner: Mutex<ChunkInner>,
}

struct ChunkInner {
    file: File,
    header: ChunkHeader,
}

impl Chunk {
    /// Parse a chunk id out of a file path's basename: the integer prefix
    /// before the final `.` (`"17.chunk"` -> `17`).
    pub fn id_from_path(path: &Path) -> Result<u32> {
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidChunkName(path.to_path_buf()))?;
        let prefix = match stem.rfind('.') {
            Some(dot) => &stem[..dot],
            None => stem,
        };
        prefix
            .parse::<u32>()
            .map_err(|_| StorageError::InvalidChunkName(path.to_path_buf()))
    }

    /// Open an existing chunk file, or create it (with a fresh header) if
    /// it does not exist. The parent directory is created best-effort.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let id = Self::id_from_path(&path)?;

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StorageError::io("chunk open", e))?;

        let header = if is_new {
            debug!("chunk {id}: creating new segment at {path:?}");
            let header = ChunkHeader::fresh();
            file.write_all(&header.encode())
                .map_err(|e| StorageError::io("chunk header write", e))?;
            file.sync_all().map_err(|e| StorageError::io("chunk sync", e))?;
            header
        } else {
            let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
            file.read_exact(&mut buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    StorageError::CorruptChunk {
                        path: path.clone(),
                        reason: format!("short read of {CHUNK_HEADER_SIZE}-byte header"),
                    }
                } else {
                    StorageError::io("chunk header read", e)
                }
            })?;
            let header = ChunkHeader::decode(&buf, &path)?;
            debug!(
                "chunk {id}: opened existing segment ({} blocks, {} bytes)",
                header.count, header.max_offset
            );
            header
        };

        Ok(Chunk {
            id,
            path,
            inner: Mutex::new(ChunkInner { file, header }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, including the 40-byte header. This is the
    /// value the storage façade compares against its segment size limit.
    pub fn max_offset(&self) -> i64 {
        self.inner.lock().expect("chunk lock poisoned").header.max_offset
    }

    pub fn block_count(&self) -> i64 {
        self.inner.lock().expect("chunk lock poisoned").header.count
    }

    /// Encode and append `payload` as a new block, returning its offset
    /// within this chunk (the offset an index slot should record).
    ///
    /// The block's bytes are written first; the header is rewritten last,
    /// so a crash mid-append is visible as a header that undercounts the
    /// tail rather than one that overclaims a half-written block.
    pub fn append(&self, name: &str, flags: u8, payload: &[u8]) -> Result<i64> {
        let frame = block::encode(name, flags, payload)?;
        let mut guard = self.inner.lock().expect("chunk lock poisoned");

        let offset = guard.header.max_offset;
        guard
            .file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| StorageError::io("chunk seek", e))?;
        guard
            .file
            .write_all(&frame)
            .map_err(|e| StorageError::io("chunk write", e))?;

        guard.header.count += 1;
        guard.header.total_bytes += frame.len() as i64;
        guard.header.max_offset = offset + frame.len() as i64;

        guard
            .file
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::io("chunk seek", e))?;
        let header_bytes = guard.header.encode();
        guard
            .file
            .write_all(&header_bytes)
            .map_err(|e| StorageError::io("chunk header rewrite", e))?;
        guard.file.sync_data().map_err(|e| StorageError::io("chunk sync", e))?;

        debug!("chunk {}: appended block at offset {offset} ({} bytes)", self.id, frame.len());
        Ok(offset)
    }

    /// Read and fully decode the block at `offset`.
    pub fn read_at(&self, offset: i64) -> Result<Block> {
        let mut guard = self.inner.lock().expect("chunk lock poisoned");
        guard
            .file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| StorageError::io("chunk seek", e))?;
        block::decode(&mut guard.file)
    }

    /// Copy the block at `offset` into `sink` without buffering the whole
    /// payload in memory, returning the block's metadata.
    pub fn transfer_at<W: Write>(&self, offset: i64, sink: &mut W) -> Result<BlockMeta> {
        let mut guard = self.inner.lock().expect("chunk lock poisoned");
        guard
            .file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| StorageError::io("chunk seek", e))?;
        let (meta, mut bounded) = block::stream(&mut guard.file)?;
        std::io::copy(&mut bounded, sink).map_err(|e| StorageError::io("chunk transfer", e))?;
        Ok(meta)
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}
