//! Gossip payloads produced and consumed by the ledger

use crate::block::Block;
use crate::data::{Bucket, Storage};
use borsh::{BorshDeserialize, BorshSerialize};

/// A point mutation made by a local write
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Delta {
    /// Merge these keys into a bucket
    Put { bucket: String, entries: Bucket },
    /// Drop a whole bucket
    DeleteBucket { bucket: String },
    /// Drop a single key
    DeleteKey { bucket: String, key: String },
}

impl Delta {
    /// Apply the mutation to a storage copy
    pub fn apply(&self, storage: &mut Storage) {
        match self {
            Delta::Put { bucket, entries } => {
                let target = storage.entry(bucket.clone()).or_default();
                for (key, value) in entries {
                    target.insert(key.clone(), value.clone());
                }
            }
            Delta::DeleteBucket { bucket } => {
                storage.remove(bucket);
            }
            Delta::DeleteKey { bucket, key } => {
                if let Some(target) = storage.get_mut(bucket) {
                    target.remove(key);
                }
            }
        }
    }

    /// Whether `storage` already reflects this mutation
    pub fn is_reflected_in(&self, storage: &Storage) -> bool {
        match self {
            Delta::Put { bucket, entries } => match storage.get(bucket) {
                Some(current) => entries.iter().all(|(k, v)| current.get(k) == Some(v)),
                None => entries.is_empty(),
            },
            Delta::DeleteBucket { bucket } => !storage.contains_key(bucket),
            Delta::DeleteKey { bucket, key } => storage
                .get(bucket)
                .map(|b| !b.contains_key(key))
                .unwrap_or(true),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Delta::Put { .. } => "put",
            Delta::DeleteBucket { .. } => "delete-bucket",
            Delta::DeleteKey { .. } => "delete-key",
        }
    }
}

/// Insert every key of `snapshot` that `storage` does not hold yet.
/// Returns whether anything was added.
pub(crate) fn fill_missing(storage: &mut Storage, snapshot: &Storage) -> bool {
    let mut changed = false;
    for (name, entries) in snapshot {
        let target = storage.entry(name.clone()).or_default();
        for (key, value) in entries {
            if !target.contains_key(key) {
                target.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }
    storage.retain(|_, bucket| !bucket.is_empty());
    changed
}

/// What travels on the ledger gossip channel
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Announcement {
    /// A block the sender just appended
    Block(Block),
    /// The mutation behind the sender's latest local write
    Mutation(Delta),
    /// The sender's head, rebroadcast periodically for peers that have not
    /// synced yet
    Snapshot(Block),
}

impl Announcement {
    pub fn kind(&self) -> &'static str {
        match self {
            Announcement::Block(_) => "block",
            Announcement::Mutation(_) => "mutation",
            Announcement::Snapshot(_) => "snapshot",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Outbound side of the ledger gossip channel.
///
/// Called while the writer lock is held, so implementations must not block.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, announcement: &Announcement);
}

/// Broadcaster for a ledger that is not attached to any network
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast(&self, _announcement: &Announcement) {}
}
