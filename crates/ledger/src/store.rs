//! Block storage backends

use crate::block::Block;
use crate::error::StoreError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Ordered, append-only block log.
///
/// Implementations must reject appends that do not directly follow the
/// current last index.
pub trait BlockStore: Send + Sync {
    /// Append the next block
    fn append(&self, block: &Block) -> Result<(), StoreError>;

    /// Index of the last stored block, `None` when empty
    fn last_index(&self) -> Option<u64>;

    /// Read a block by index
    fn read(&self, index: u64) -> Result<Option<Block>, StoreError>;

    /// Read the last stored block
    fn last(&self) -> Result<Option<Block>, StoreError> {
        match self.last_index() {
            Some(index) => self.read(index),
            None => Ok(None),
        }
    }
}

pub(crate) fn check_order(last: Option<u64>, block: &Block) -> Result<(), StoreError> {
    let expected = last.map(|i| i + 1).unwrap_or(0);
    if block.index != expected {
        return Err(StoreError::OutOfOrder {
            expected,
            got: block.index,
        });
    }
    Ok(())
}

/// Thread-safe in-memory block storage
///
/// Uses DashMap for lock-free concurrent reads of historical blocks.
#[derive(Clone)]
pub struct MemoryStore {
    blocks: Arc<DashMap<u64, Block>>,
    last: Arc<RwLock<Option<u64>>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(DashMap::new()),
            last: Arc::new(RwLock::new(None)),
        }
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryStore {
    fn append(&self, block: &Block) -> Result<(), StoreError> {
        let mut last = self.last.write();
        check_order(*last, block)?;
        self.blocks.insert(block.index, block.clone());
        *last = Some(block.index);
        Ok(())
    }

    fn last_index(&self) -> Option<u64> {
        *self.last.read()
    }

    fn read(&self, index: u64) -> Result<Option<Block>, StoreError> {
        Ok(self.blocks.get(&index).map(|r| r.value().clone()))
    }
}
