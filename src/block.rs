//! Block format — one stored object's on-disk frame inside a chunk.
//!
//! # On-disk layout (30-byte fixed header, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   crc32          IEEE CRC32 of payload only     (BE u32)
//!    4      1   flags          bitfield, see FLAG_*           (u8)
//!    5      8   timestamp      Unix seconds, write time       (BE i64)
//!   13      1   name_len       1..=255                        (u8)
//!   14      N   name           UTF-8 bytes, length = name_len
//! 14+N      8   payload_size   bytes                          (BE i64)
//! 22+N      8   payload_offset historical; == payload_size on write (BE i64)
//! 30+N      S   payload        S = payload_size bytes
//! ```
//!
//! Every multi-byte field in every on-disk format in this crate is
//! big-endian. This is not negotiated.
//!
//! `decode` and `stream` do not verify `crc32` against the payload — the
//! value is carried through as-is so a caller that doesn't care about
//! integrity (e.g. a cache warm-up scan) isn't forced to pay for it. Callers
//! that want the check call [`Block::verify_crc32`] explicitly.

use std::io::{self, Read, Take};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32Hasher;

use crate::error::{Result, StorageError};

/// Size of the fixed-width portion of a block frame (everything but `name`
/// and `payload`).
pub const BLOCK_HEADER_FIXED_SIZE: usize = 30;

/// No flags set.
pub const FLAG_NONE: u8 = 0x00;
/// Object is private.
pub const FLAG_PRIVATE: u8 = 0x01;
/// Logical deletion marker.
pub const FLAG_DELETED: u8 = 0x02;
/// Payload is executable.
pub const FLAG_EXECUTABLE: u8 = 0x04;
/// Caller-derived id used MD5 (advisory; this store's own dedup key is
/// always CRC32-IEEE regardless of this flag).
pub const FLAG_ID_MD5: u8 = 0x08;
/// Caller-derived id used CRC32 (the current default).
pub const FLAG_ID_CRC32: u8 = 0x10;

/// A fully decoded block: metadata plus the buffered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub flags: u8,
    pub crc32: u32,
    pub timestamp: i64,
    pub name: String,
    pub payload_size: i64,
    pub payload_offset: i64,
    pub payload: Vec<u8>,
}

impl Block {
    /// On-disk size of this block's frame: `30 + name_len + payload_size`.
    pub fn on_disk_size(&self) -> i64 {
        BLOCK_HEADER_FIXED_SIZE as i64 + self.name.len() as i64 + self.payload_size
    }

    /// Recompute CRC32-IEEE over `self.payload` and compare against the
    /// stored `crc32`. Opt-in; nothing in the read path calls this
    /// implicitly.
    pub fn verify_crc32(&self) -> bool {
        crc32_of(&self.payload) == self.crc32
    }
}

/// Metadata for a block whose payload has not been read yet — the result of
/// [`stream`] before the caller consumes the bounded reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub flags: u8,
    pub crc32: u32,
    pub timestamp: i64,
    pub name: String,
    pub payload_size: i64,
    pub payload_offset: i64,
}

/// CRC32-IEEE over `data`. This is the identifier scheme used throughout
/// this crate (the dedup key).
pub fn crc32_of(data: &[u8]) -> u32 {
    let mut h = Crc32Hasher::new();
    h.update(data);
    h.finalize()
}

/// MD5 of `data`. Provided as a hashing helper for callers that want to
/// derive an external identifier tagged with [`FLAG_ID_MD5`]; this store's
/// own dedup key is always CRC32-IEEE.
pub fn md5_of(data: &[u8]) -> [u8; 16] {
    use md5::{Digest, Md5};
    let mut h = Md5::new();
    h.update(data);
    h.finalize().into()
}

/// Encode `payload` tagged with `name` and `flags` into a full block frame.
///
/// Fails with [`StorageError::InvalidName`] if `name` is empty or exceeds
/// 255 bytes.
pub fn encode(name: &str, flags: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let name_bytes = name.as_bytes();
    if name_bytes.is_empty() || name_bytes.len() > 255 {
        return Err(StorageError::InvalidName(name_bytes.len()));
    }

    let crc32 = crc32_of(payload);
    let timestamp = now_unix();
    let payload_size = payload.len() as i64;

    let mut buf = Vec::with_capacity(BLOCK_HEADER_FIXED_SIZE + name_bytes.len() + payload.len());
    buf.write_u32::<BigEndian>(crc32).expect("write to Vec never fails");
    buf.write_u8(flags).expect("write to Vec never fails");
    buf.write_i64::<BigEndian>(timestamp).expect("write to Vec never fails");
    buf.write_u8(name_bytes.len() as u8).expect("write to Vec never fails");
    buf.extend_from_slice(name_bytes);
    buf.write_i64::<BigEndian>(payload_size).expect("write to Vec never fails");
    // payload_offset is historical: frozen equal to payload_size on write.
    buf.write_i64::<BigEndian>(payload_size).expect("write to Vec never fails");
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decode a full block frame from `r`, eagerly reading the payload into
/// memory.
pub fn decode<R: Read>(mut r: R) -> Result<Block> {
    let (meta, mut limited) = read_meta(&mut r)?;

    let mut payload = vec![0u8; meta.payload_size as usize];
    limited
        .read_exact(&mut payload)
        .map_err(|e| map_short_read(e, meta.payload_size as usize))?;

    Ok(Block {
        flags: meta.flags,
        crc32: meta.crc32,
        timestamp: meta.timestamp,
        name: meta.name,
        payload_size: meta.payload_size,
        payload_offset: meta.payload_offset,
        payload,
    })
}

/// Decode a block's metadata from `r`, then hand back a reader bounded to
/// exactly `payload_size` bytes so the caller can splice the payload
/// (e.g. to a socket) without buffering it in memory and without
/// over-reading past the block's end.
pub fn stream<R: Read>(r: R) -> Result<(BlockMeta, Take<R>)> {
    read_meta(r)
}

/// Shared prefix of `decode`/`stream`: read the fixed header, the name,
/// `payload_size`, and `payload_offset`, then return the metadata plus a
/// reader bounded to the remaining `payload_size` bytes.
fn read_meta<R: Read>(mut r: R) -> Result<(BlockMeta, Take<R>)> {
    let crc32 = r.read_u32::<BigEndian>().map_err(|e| map_short_read(e, 4))?;
    let flags = r.read_u8().map_err(|e| map_short_read(e, 1))?;
    let timestamp = r.read_i64::<BigEndian>().map_err(|e| map_short_read(e, 8))?;
    let name_len = r.read_u8().map_err(|e| map_short_read(e, 1))? as usize;

    if name_len == 0 {
        return Err(StorageError::InvalidName(0));
    }

    let mut name_buf = vec![0u8; name_len];
    r.read_exact(&mut name_buf)
        .map_err(|e| map_short_read(e, name_len))?;
    let name = String::from_utf8(name_buf).map_err(|_| StorageError::CorruptChunk {
        path: Default::default(),
        reason: "block name is not valid UTF-8".into(),
    })?;

    let payload_size = r.read_i64::<BigEndian>().map_err(|e| map_short_read(e, 8))?;
    let payload_offset = r.read_i64::<BigEndian>().map_err(|e| map_short_read(e, 8))?;

    if payload_size < 0 {
        return Err(StorageError::CorruptChunk {
            path: Default::default(),
            reason: format!("negative payload_size {payload_size}"),
        });
    }

    let meta = BlockMeta {
        flags,
        crc32,
        timestamp,
        name,
        payload_size,
        payload_offset,
    };
    Ok((meta, r.take(payload_size as u64)))
}

fn map_short_read(e: io::Error, expected: usize) -> StorageError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        StorageError::ShortRead { expected, got: 0 }
    } else {
        StorageError::io("block read", e)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_small_payload() {
        let before = now_unix();
        let frame = encode("hello.txt", FLAG_ID_CRC32, b"hello").unwrap();
        let block = decode(Cursor::new(frame)).unwrap();

        assert_eq!(block.name, "hello.txt");
        assert_eq!(block.flags, FLAG_ID_CRC32);
        assert_eq!(block.payload, b"hello");
        assert_eq!(block.payload_size, 5);
        assert_eq!(block.payload_offset, 5);
        assert_eq!(block.crc32, crc32_of(b"hello"));
        assert!(block.timestamp >= before);
        assert!(block.verify_crc32());
    }

    #[test]
    fn round_trip_empty_payload() {
        let frame = encode("a", FLAG_ID_CRC32, b"").unwrap();
        let block = decode(Cursor::new(frame)).unwrap();
        assert_eq!(block.payload, b"");
        assert_eq!(block.crc32, 0x0000_0000);
        assert_eq!(block.on_disk_size(), 30 + 1);
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(encode("", FLAG_NONE, b"x"), Err(StorageError::InvalidName(0))));
    }

    #[test]
    fn rejects_oversized_name() {
        let name = "n".repeat(256);
        assert!(matches!(
            encode(&name, FLAG_NONE, b"x"),
            Err(StorageError::InvalidName(256))
        ));
    }

    #[test]
    fn stream_is_bounded_and_does_not_over_read() {
        let frame_a = encode("a", FLAG_NONE, b"AAAA").unwrap();
        let frame_b = encode("b", FLAG_NONE, b"BBBB").unwrap();
        let mut both = frame_a.clone();
        both.extend_from_slice(&frame_b);

        let mut cursor = Cursor::new(both);
        let (meta, mut bounded) = stream(&mut cursor).unwrap();
        assert_eq!(meta.name, "a");
        assert_eq!(meta.payload_size, 4);

        let mut payload = Vec::new();
        bounded.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"AAAA");

        // Cursor position must sit exactly at the start of the next frame.
        let (meta2, _) = stream(&mut cursor).unwrap();
        assert_eq!(meta2.name, "b");
    }

    #[test]
    fn short_read_on_truncated_frame() {
        let frame = encode("hello.txt", FLAG_NONE, b"hello world").unwrap();
        let truncated = &frame[..frame.len() - 3];
        let err = decode(Cursor::new(truncated)).unwrap_err();
        assert!(matches!(err, StorageError::ShortRead { .. }));
    }

    #[test]
    fn md5_and_crc32_helpers_are_available() {
        assert_eq!(crc32_of(b"hello"), 0x3610_A686);
        assert_eq!(md5_of(b"").len(), 16);
    }
}
