//! Hash-chained blocks carrying full ledger snapshots

use crate::data::{Bucket, Storage};
use crate::error::ChainError;
use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Timestamp stamped on the genesis block of every peer
pub const GENESIS_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// One link of the ledger chain.
///
/// Each block holds the complete storage snapshot after the mutation that
/// produced it, so any single valid block is enough to reconstruct state.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain, genesis is 0
    pub index: u64,
    /// RFC3339 creation time
    pub timestamp: String,
    /// Full key/value snapshot
    pub storage: Storage,
    /// Hex SHA-256 over index, timestamp, storage and prev_hash
    pub hash: String,
    /// Hash of the preceding block, empty for genesis
    pub prev_hash: String,
}

impl Block {
    /// The deterministic first block shared by every peer
    pub fn genesis() -> Self {
        let mut block = Self {
            index: 0,
            timestamp: GENESIS_TIMESTAMP.to_string(),
            storage: Storage::new(),
            hash: String::new(),
            prev_hash: String::new(),
        };
        block.hash = block.checksum();
        block
    }

    /// Build the successor of this block holding `storage`
    pub fn next(&self, storage: Storage) -> Self {
        let mut block = Self {
            index: self.index + 1,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            storage,
            hash: String::new(),
            prev_hash: self.hash.clone(),
        };
        block.hash = block.checksum();
        block
    }

    /// Recompute the hash from the block contents
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        // Writes into a hasher are infallible
        let _ = BorshSerialize::serialize(&self.index, &mut hasher);
        let _ = BorshSerialize::serialize(&self.timestamp, &mut hasher);
        let _ = BorshSerialize::serialize(&self.storage, &mut hasher);
        let _ = BorshSerialize::serialize(&self.prev_hash, &mut hasher);
        hex::encode(hasher.finalize())
    }

    /// Check that this block directly extends `prev`
    pub fn validate(&self, prev: &Block) -> Result<(), ChainError> {
        if self.index != prev.index + 1 {
            return Err(ChainError::NonContiguous {
                expected: prev.index + 1,
                got: self.index,
            });
        }
        if self.prev_hash != prev.hash {
            return Err(ChainError::PrevHashMismatch { index: self.index });
        }
        if !self.has_valid_checksum() {
            return Err(ChainError::ChecksumMismatch { index: self.index });
        }
        Ok(())
    }

    pub fn is_valid(&self, prev: &Block) -> bool {
        self.validate(prev).is_ok()
    }

    pub fn has_valid_checksum(&self) -> bool {
        self.hash == self.checksum()
    }

    /// Bucket lookup on this snapshot
    pub fn bucket(&self, name: &str) -> Option<&Bucket> {
        self.storage.get(name)
    }

    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;

    fn storage_with(bucket: &str, key: &str, value: &str) -> Storage {
        let mut storage = Storage::new();
        storage
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), Data::string(value));
        storage
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a, b);
        assert_eq!(a.index, 0);
        assert!(a.prev_hash.is_empty());
        assert!(a.has_valid_checksum());
    }

    #[test]
    fn test_next_block_is_valid() {
        let genesis = Block::genesis();
        let next = genesis.next(storage_with("machines", "10.1.0.1", "peer"));
        assert_eq!(next.index, 1);
        assert_eq!(next.prev_hash, genesis.hash);
        assert!(next.is_valid(&genesis));
    }

    #[test]
    fn test_tampered_storage_is_rejected() {
        let genesis = Block::genesis();
        let mut next = genesis.next(storage_with("machines", "10.1.0.1", "peer"));
        next.storage = storage_with("machines", "10.1.0.1", "intruder");
        assert_eq!(
            next.validate(&genesis),
            Err(ChainError::ChecksumMismatch { index: 1 })
        );
    }

    #[test]
    fn test_gap_is_rejected() {
        let genesis = Block::genesis();
        let first = genesis.next(Storage::new());
        let second = first.next(Storage::new());
        assert_eq!(
            second.validate(&genesis),
            Err(ChainError::NonContiguous { expected: 1, got: 2 })
        );
    }

    #[test]
    fn test_divergent_prev_hash_is_rejected() {
        let genesis = Block::genesis();
        let mine = genesis.next(storage_with("a", "k", "mine"));
        let theirs = genesis.next(storage_with("a", "k", "theirs"));
        let on_theirs = theirs.next(Storage::new());
        assert_eq!(
            on_theirs.validate(&mine),
            Err(ChainError::PrevHashMismatch { index: 2 })
        );
    }

    #[test]
    fn test_bytes_roundtrip_keeps_hash() {
        let block = Block::genesis().next(storage_with("files", "f", "x"));
        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.has_valid_checksum());
    }
}
