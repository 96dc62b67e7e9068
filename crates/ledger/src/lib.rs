//! meshvpn ledger - gossip-replicated, hash-chained key/value store
//!
//! This crate provides the shared state every peer of the overlay agrees on:
//! - Blocks carrying full storage snapshots, linked by SHA-256
//! - In-memory and sled-backed block stores
//! - The `Ledger` with single-writer merges, periodic announcers and
//!   remote block ingestion

pub mod announcement;
pub mod block;
pub mod data;
pub mod error;
pub mod ledger;
pub mod persistence;
pub mod store;

pub use announcement::{Announcement, Broadcaster, Delta, NoopBroadcaster};
pub use block::{Block, GENESIS_TIMESTAMP};
pub use data::{Bucket, Data, Storage};
pub use error::{ChainError, DataError, LedgerError, StoreError};
pub use ledger::{spawn_periodic, IngestOutcome, Ledger};
pub use persistence::{DiskStore, DiskStoreConfig};
pub use store::{BlockStore, MemoryStore};

/// Retry cadence for confirmed writes
pub const DEFAULT_PERSIST_RETRY_SECS: u64 = 5;
