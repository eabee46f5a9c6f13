//! On-disk chunk storage for a single container replica
//!
//! Layout:
//! - `<root>/<container>/blocks/<block>.blk` — block data, chunks written
//!   at their deterministic offsets
//! - `<root>/<container>/blocks.idx` — finalized-block index snapshot
//!
//! Chunk writes are positioned, never appended: replaying the same
//! committed entry lands every byte in the same place, which is what
//! makes crash-restart replay idempotent.

use crate::common::{blake3_hash, crc32, Result};
use crate::container::{BlockId, ContainerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const INDEX_MAGIC: &[u8; 8] = b"CARTIDX1";

/// Metadata for a finalized block.
///
/// Deliberately carries no wall-clock fields so that replaying the same
/// log twice produces byte-identical snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub len: u64,
    pub checksum: String,
    pub chunk_count: u32,
}

/// Chunk store for one container replica
pub struct ChunkStore {
    container: ContainerId,
    root: PathBuf,
    blocks: HashMap<BlockId, BlockMeta>,
    used_bytes: u64,
}

impl ChunkStore {
    /// Open or create the store under `data_path/<container>`
    pub fn open(data_path: &Path, container: ContainerId) -> Result<Self> {
        let root = data_path.join(container.to_string());
        fs::create_dir_all(root.join("blocks"))?;

        let index_path = root.join("blocks.idx");
        let blocks = if index_path.exists() {
            Self::load_index(&index_path)?
        } else {
            HashMap::new()
        };

        let used_bytes = Self::scan_used_bytes(&root)?;

        tracing::debug!(
            container,
            finalized = blocks.len(),
            used_bytes,
            "chunk store opened"
        );

        Ok(Self {
            container,
            root,
            blocks,
            used_bytes,
        })
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn finalized_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_meta(&self, block: BlockId) -> Option<&BlockMeta> {
        self.blocks.get(&block)
    }

    fn block_path(&self, block: BlockId) -> PathBuf {
        self.root.join("blocks").join(format!("{}.blk", block))
    }

    /// Write a chunk at its deterministic offset.
    ///
    /// The payload CRC is verified before anything touches disk, so a
    /// corrupt replication payload never lands.
    pub fn write_chunk(&mut self, block: BlockId, offset: u64, data: &[u8], crc: u32) -> Result<()> {
        let actual = crc32(data);
        if actual != crc {
            return Err(crate::Error::ChecksumMismatch {
                expected: format!("{:08x}", crc),
                actual: format!("{:08x}", actual),
            });
        }

        let path = self.block_path(block);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)?;

        let old_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;

        let new_len = file.metadata()?.len();
        self.used_bytes += new_len.saturating_sub(old_len);

        Ok(())
    }

    /// Read a chunk back from its deterministic offset, CRC-verified.
    /// Used by the leader to serve log data to catching-up followers.
    pub fn read_chunk(&self, block: BlockId, offset: u64, len: u64, crc: u32) -> Result<Bytes> {
        let path = self.block_path(block);
        let mut file = File::open(&path).map_err(|e| crate::Error::ReadFailed {
            container: self.container,
            reason: format!("block {} unreadable: {}", block, e),
        })?;

        let mut buf = vec![0u8; len as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf).map_err(|e| crate::Error::ReadFailed {
            container: self.container,
            reason: format!("block {} short read at {}: {}", block, offset, e),
        })?;

        let actual = crc32(&buf);
        if actual != crc {
            return Err(crate::Error::ChecksumMismatch {
                expected: format!("{:08x}", crc),
                actual: format!("{:08x}", actual),
            });
        }

        Ok(Bytes::from(buf))
    }

    /// Record a block as finalized. Refinalizing with identical metadata
    /// is a no-op, so log replay converges.
    pub fn finalize_block(
        &mut self,
        block: BlockId,
        len: u64,
        checksum: &str,
        chunk_count: u32,
    ) -> Result<()> {
        let path = self.block_path(block);
        let file_len = fs::metadata(&path)
            .map_err(|_| crate::Error::BlockNotFound {
                container: self.container,
                block,
            })?
            .len();

        if file_len < len {
            return Err(crate::Error::Corrupted(format!(
                "block {} has {} bytes, finalize expects {}",
                block, file_len, len
            )));
        }

        self.blocks.insert(
            block,
            BlockMeta {
                len,
                checksum: checksum.to_string(),
                chunk_count,
            },
        );
        self.save_index()?;

        Ok(())
    }

    /// Read a finalized block in full, verifying its BLAKE3 checksum.
    pub fn read_block(&self, block: BlockId) -> Result<Bytes> {
        let meta = self
            .blocks
            .get(&block)
            .ok_or(crate::Error::BlockNotFound {
                container: self.container,
                block,
            })?;

        let path = self.block_path(block);
        let mut file = File::open(&path).map_err(|e| crate::Error::ReadFailed {
            container: self.container,
            reason: format!("block {} unreadable: {}", block, e),
        })?;

        let mut buf = vec![0u8; meta.len as usize];
        file.read_exact(&mut buf).map_err(|e| crate::Error::ReadFailed {
            container: self.container,
            reason: format!("block {} truncated: {}", block, e),
        })?;

        let actual = blake3_hash(&buf);
        if actual != meta.checksum {
            return Err(crate::Error::ChecksumMismatch {
                expected: meta.checksum.clone(),
                actual,
            });
        }

        Ok(Bytes::from(buf))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("blocks.idx")
    }

    fn save_index(&self) -> Result<()> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(INDEX_MAGIC);
        // BTreeMap for a stable entry order across replays
        let ordered: std::collections::BTreeMap<_, _> = self.blocks.iter().collect();
        let body = bincode::serialize(&ordered)
            .map_err(|e| crate::Error::Internal(format!("index serialize: {}", e)))?;
        out.extend_from_slice(&body);

        let tmp = self.index_path().with_extension("idx.tmp");
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, self.index_path())?;
        Ok(())
    }

    fn load_index(path: &Path) -> Result<HashMap<BlockId, BlockMeta>> {
        let raw = fs::read(path)?;
        if raw.len() < INDEX_MAGIC.len() || &raw[..INDEX_MAGIC.len()] != INDEX_MAGIC {
            return Err(crate::Error::Corrupted("invalid block index magic".into()));
        }
        let ordered: std::collections::BTreeMap<BlockId, BlockMeta> =
            bincode::deserialize(&raw[INDEX_MAGIC.len()..])
                .map_err(|e| crate::Error::Corrupted(format!("block index: {}", e)))?;
        Ok(ordered.into_iter().collect())
    }

    fn scan_used_bytes(root: &Path) -> Result<u64> {
        let mut total = 0;
        let blocks_dir = root.join("blocks");
        if blocks_dir.exists() {
            for entry in fs::read_dir(&blocks_dir)? {
                total += entry?.metadata()?.len();
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(data: &[u8]) -> (Bytes, u32) {
        (Bytes::copy_from_slice(data), crc32(data))
    }

    #[test]
    fn test_write_finalize_read() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path(), 1).unwrap();

        let (c1, crc1) = chunk(b"hello ");
        let (c2, crc2) = chunk(b"world");
        store.write_chunk(10, 0, &c1, crc1).unwrap();
        store.write_chunk(10, c1.len() as u64, &c2, crc2).unwrap();

        let full = b"hello world";
        store
            .finalize_block(10, full.len() as u64, &blake3_hash(full), 2)
            .unwrap();

        let read = store.read_block(10).unwrap();
        assert_eq!(&read[..], full);
        assert_eq!(store.finalized_blocks(), 1);
        assert_eq!(store.used_bytes(), full.len() as u64);
    }

    #[test]
    fn test_chunk_crc_rejected_before_disk() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path(), 2).unwrap();

        let err = store.write_chunk(1, 0, b"data", 0xdeadbeef).unwrap_err();
        assert!(matches!(err, crate::Error::ChecksumMismatch { .. }));
        assert_eq!(store.used_bytes(), 0);
    }

    #[test]
    fn test_rewrite_same_offset_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path(), 3).unwrap();

        let (data, crc) = chunk(b"same bytes");
        store.write_chunk(5, 0, &data, crc).unwrap();
        store.write_chunk(5, 0, &data, crc).unwrap();
        store.write_chunk(5, 0, &data, crc).unwrap();

        assert_eq!(store.used_bytes(), data.len() as u64);
        store
            .finalize_block(5, data.len() as u64, &blake3_hash(&data), 1)
            .unwrap();
        assert_eq!(&store.read_block(5).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_read_missing_block() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(dir.path(), 4).unwrap();
        assert!(matches!(
            store.read_block(99).unwrap_err(),
            crate::Error::BlockNotFound { .. }
        ));
    }

    #[test]
    fn test_read_chunk_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path(), 5).unwrap();

        let (data, crc) = chunk(b"catch-up payload");
        store.write_chunk(1, 128, &data, crc).unwrap();

        let back = store.read_chunk(1, 128, data.len() as u64, crc).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (data, crc) = chunk(b"persist me");

        {
            let mut store = ChunkStore::open(dir.path(), 6).unwrap();
            store.write_chunk(1, 0, &data, crc).unwrap();
            store
                .finalize_block(1, data.len() as u64, &blake3_hash(&data), 1)
                .unwrap();
        }

        let store = ChunkStore::open(dir.path(), 6).unwrap();
        assert_eq!(store.finalized_blocks(), 1);
        assert_eq!(&store.read_block(1).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_corrupted_block_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path(), 7).unwrap();

        let (data, crc) = chunk(b"original content");
        store.write_chunk(1, 0, &data, crc).unwrap();
        store
            .finalize_block(1, data.len() as u64, &blake3_hash(&data), 1)
            .unwrap();

        // Flip bytes behind the store's back
        let path = dir.path().join("7").join("blocks").join("1.blk");
        std::fs::write(&path, b"corrupted contents").unwrap();

        assert!(matches!(
            store.read_block(1).unwrap_err(),
            crate::Error::ChecksumMismatch { .. }
        ));
    }
}
