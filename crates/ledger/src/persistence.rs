//! Disk-backed block store
//!
//! Uses sled embedded database to persist the chain across restarts.
//! Memory use is bounded twice: sled's page cache is capped by
//! `cache_capacity` bytes and decoded blocks sit in a fixed-size LRU.

use crate::block::Block;
use crate::error::StoreError;
use crate::store::{check_order, BlockStore};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use sled::Db;
use std::num::NonZeroUsize;
use std::path::Path;

const HEAD_KEY: &str = "head";

/// Sizing for [`DiskStore`]
#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    /// Bytes of sled page cache
    pub cache_capacity: u64,
    /// Decoded blocks kept in memory
    pub block_cache: usize,
}

impl Default for DiskStoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 50 * 1024 * 1024,
            block_cache: 256,
        }
    }
}

/// Persistent block log
pub struct DiskStore {
    /// Sled database instance
    db: Db,
    /// Blocks keyed by big-endian index
    blocks: sled::Tree,
    /// Head pointer
    meta: sled::Tree,
    /// Cached head index
    last: RwLock<Option<u64>>,
    /// Recently read or written blocks
    cache: Mutex<LruCache<u64, Block>>,
}

impl DiskStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P, config: &DiskStoreConfig) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .path(&path)
            .cache_capacity(config.cache_capacity)
            .open()?;
        let blocks = db.open_tree("blocks")?;
        let meta = db.open_tree("meta")?;

        let last = match meta.get(HEAD_KEY)? {
            Some(bytes) => Some(decode_index(&bytes)?),
            None => None,
        };

        let capacity = NonZeroUsize::new(config.block_cache).unwrap_or(NonZeroUsize::MIN);

        tracing::info!("Opened block store at {:?} (head {:?})", path.as_ref(), last);

        Ok(Self {
            db,
            blocks,
            meta,
            last: RwLock::new(last),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for DiskStore {
    fn append(&self, block: &Block) -> Result<(), StoreError> {
        let mut last = self.last.write();
        check_order(*last, block)?;

        let key = block.index.to_be_bytes();
        let bytes = bincode::serialize(block)?;
        self.blocks.insert(key, bytes)?;
        self.meta.insert(HEAD_KEY, &key[..])?;

        *last = Some(block.index);
        self.cache.lock().put(block.index, block.clone());
        Ok(())
    }

    fn last_index(&self) -> Option<u64> {
        *self.last.read()
    }

    fn read(&self, index: u64) -> Result<Option<Block>, StoreError> {
        if let Some(block) = self.cache.lock().get(&index) {
            return Ok(Some(block.clone()));
        }

        match self.blocks.get(index.to_be_bytes())? {
            Some(bytes) => {
                let block: Block = bincode::deserialize(&bytes)?;
                self.cache.lock().put(index, block.clone());
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }
}

fn decode_index(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("head pointer of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}
