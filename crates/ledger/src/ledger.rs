//! Gossip-replicated key/value ledger
//!
//! Every mutation produces a new block holding the full storage snapshot.
//! Writes are serialized through one writer lock; readers work on an
//! `Arc<Block>` snapshot and never wait for a writer.
//!
//! Three kinds of message keep peers in step:
//! - a remote block is adopted only when it directly extends the local head,
//!   anything else is discarded
//! - a remote point mutation is committed as a local write unless the head
//!   already reflects it
//! - a remote snapshot fills in missing keys once, while this ledger has not
//!   synced with the network yet. After that, snapshots are treated like
//!   blocks, so a stale peer can never bring back keys deleted here.

use crate::announcement::{fill_missing, Announcement, Broadcaster, Delta};
use crate::block::Block;
use crate::data::{Bucket, Data, Storage};
use crate::error::{ChainError, LedgerError};
use crate::store::BlockStore;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Result of offering a remote announcement to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The block extended the local head and was appended as-is
    Adopted { index: u64 },
    /// A remote mutation was committed in a new local block
    Applied { index: u64 },
    /// Missing keys of a snapshot were merged into a new local block
    Merged { index: u64 },
    /// The mutation or snapshot was already reflected locally
    Unchanged,
    /// The block did not extend the local head
    Discarded(ChainError),
}

/// State guarded by the writer lock
#[derive(Default)]
struct Writer {
    /// Set once the ledger holds network state, either by adopting a remote
    /// block or by merging a snapshot
    synced: bool,
}

/// The replicated ledger
pub struct Ledger {
    store: Arc<dyn BlockStore>,
    broadcaster: Arc<dyn Broadcaster>,
    /// Current head, also the change notification channel
    head: watch::Sender<Arc<Block>>,
    /// Single writer
    writer: Mutex<Writer>,
}

impl Ledger {
    /// Open a ledger on `store`, appending genesis when the store is empty
    pub fn new(store: Arc<dyn BlockStore>, broadcaster: Arc<dyn Broadcaster>) -> Result<Self, LedgerError> {
        let head = match store.last()? {
            Some(block) => {
                tracing::info!("Ledger resumed at block {}", block.index);
                block
            }
            None => {
                let genesis = Block::genesis();
                store.append(&genesis)?;
                genesis
            }
        };

        let (head, _) = watch::channel(Arc::new(head));

        Ok(Self {
            store,
            broadcaster,
            head,
            writer: Mutex::new(Writer::default()),
        })
    }

    /// Merge `updates` into `bucket` in a new block
    pub fn add(&self, bucket: &str, updates: Bucket) -> Result<Arc<Block>, LedgerError> {
        let _guard = self.writer.lock();
        self.commit(
            Delta::Put {
                bucket: bucket.to_string(),
                entries: updates,
            },
            true,
        )
    }

    /// Write a single typed value
    pub fn add_value<T: Serialize + ?Sized>(&self, bucket: &str, key: &str, value: &T) -> Result<Arc<Block>, LedgerError> {
        let mut updates = Bucket::new();
        updates.insert(key.to_string(), Data::encode(value)?);
        self.add(bucket, updates)
    }

    /// Remove a whole bucket in a new block
    pub fn delete_bucket(&self, bucket: &str) -> Result<Arc<Block>, LedgerError> {
        let _guard = self.writer.lock();
        self.commit(
            Delta::DeleteBucket {
                bucket: bucket.to_string(),
            },
            true,
        )
    }

    /// Remove one key in a new block
    pub fn delete(&self, bucket: &str, key: &str) -> Result<Arc<Block>, LedgerError> {
        let _guard = self.writer.lock();
        self.commit(
            Delta::DeleteKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            true,
        )
    }

    /// Value of `key` in `bucket` on the current head
    pub fn get_key(&self, bucket: &str, key: &str) -> Option<Data> {
        self.last_block().storage.get(bucket)?.get(key).cloned()
    }

    /// Typed read; values that do not decode as `T` read as absent
    pub fn get_value<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Option<T> {
        let data = self.get_key(bucket, key)?;
        match data.decode() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!("Undecodable value at {}/{}: {}", bucket, key, e);
                None
            }
        }
    }

    /// Whether any value in `bucket` satisfies `predicate`
    pub fn exists<F>(&self, bucket: &str, predicate: F) -> bool
    where
        F: Fn(&Data) -> bool,
    {
        self.last_block()
            .storage
            .get(bucket)
            .map(|b| b.values().any(predicate))
            .unwrap_or(false)
    }

    /// Copy of one bucket
    pub fn bucket(&self, name: &str) -> Option<Bucket> {
        self.last_block().storage.get(name).cloned()
    }

    /// Copy of the whole current storage
    pub fn current_data(&self) -> Storage {
        self.last_block().storage.clone()
    }

    /// Current head snapshot
    pub fn last_block(&self) -> Arc<Block> {
        self.head.borrow().clone()
    }

    /// Subscribe to head changes
    pub fn watch(&self) -> watch::Receiver<Arc<Block>> {
        self.head.subscribe()
    }

    /// Offer a message received from the network
    pub fn ingest(&self, announcement: Announcement) -> Result<IngestOutcome, LedgerError> {
        let mut writer = self.writer.lock();
        match announcement {
            Announcement::Block(block) => self.ingest_block(&mut writer, block),
            Announcement::Mutation(delta) => {
                if delta.is_reflected_in(&self.last_block().storage) {
                    return Ok(IngestOutcome::Unchanged);
                }
                tracing::debug!("Applying remote {} mutation", delta.kind());
                let block = self.commit(delta, false)?;
                Ok(IngestOutcome::Applied { index: block.index })
            }
            Announcement::Snapshot(block) => {
                if writer.synced || block.storage.is_empty() || !block.has_valid_checksum() {
                    return self.ingest_block(&mut writer, block);
                }

                let last = self.last_block();
                if block.is_valid(&last) {
                    return self.ingest_block(&mut writer, block);
                }

                writer.synced = true;
                let mut storage = last.storage.clone();
                if !fill_missing(&mut storage, &block.storage) {
                    return Ok(IngestOutcome::Unchanged);
                }
                tracing::info!("Synced with snapshot at block {}", block.index);
                let merged = self.append(last.next(storage))?;
                Ok(IngestOutcome::Merged { index: merged.index })
            }
        }
    }

    /// Adopt `block` if it extends the head. Caller holds the writer lock.
    fn ingest_block(&self, writer: &mut Writer, block: Block) -> Result<IngestOutcome, LedgerError> {
        if !block.has_valid_checksum() {
            return Ok(IngestOutcome::Discarded(ChainError::ChecksumMismatch { index: block.index }));
        }
        match block.validate(&self.last_block()) {
            Ok(()) => {
                let index = block.index;
                self.store.append(&block)?;
                self.head.send_replace(Arc::new(block));
                writer.synced = true;
                tracing::debug!("Adopted block {}", index);
                Ok(IngestOutcome::Adopted { index })
            }
            Err(reason) => {
                tracing::trace!("Discarded block {}: {}", block.index, reason);
                Ok(IngestOutcome::Discarded(reason))
            }
        }
    }

    /// Spawn a task that runs `f` now and then on every `interval` tick
    /// until `cancel` fires
    pub fn announce<F, Fut>(&self, cancel: CancellationToken, interval: Duration, f: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        spawn_periodic(cancel, interval, f)
    }

    /// Heartbeat: write `bucket/key = value` on every tick
    pub fn announce_update(
        self: &Arc<Self>,
        cancel: CancellationToken,
        interval: Duration,
        bucket: &str,
        key: &str,
        value: Data,
    ) -> JoinHandle<()> {
        let ledger = self.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.announce(cancel, interval, move || {
            let mut updates = Bucket::new();
            updates.insert(key.clone(), value.clone());
            if let Err(e) = ledger.add(&bucket, updates) {
                tracing::warn!("Failed to announce {}/{}: {}", bucket, key, e);
            }
            async {}
        })
    }

    /// Write `bucket/key = value` every `retry` until it reads back, giving
    /// up after `timeout`
    pub async fn persist(
        &self,
        cancel: &CancellationToken,
        retry: Duration,
        timeout: Duration,
        bucket: &str,
        key: &str,
        value: Data,
    ) -> Result<(), LedgerError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(non_zero(retry));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
                _ = &mut deadline => {
                    return Err(LedgerError::Timeout {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                _ = ticker.tick() => {
                    let mut updates = Bucket::new();
                    updates.insert(key.to_string(), value.clone());
                    if let Err(e) = self.add(bucket, updates) {
                        tracing::warn!("Persist of {}/{} failed, retrying: {}", bucket, key, e);
                        continue;
                    }
                    if self.get_key(bucket, key).as_ref() == Some(&value) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Periodically re-broadcast the head so peers that missed the last
    /// block can adopt it and peers that just joined can sync
    pub fn synchronizer(self: &Arc<Self>, cancel: CancellationToken, interval: Duration) -> JoinHandle<()> {
        let ledger = self.clone();
        self.announce(cancel, interval, move || {
            let head = ledger.last_block();
            ledger.broadcaster.broadcast(&Announcement::Snapshot((*head).clone()));
            async {}
        })
    }

    /// Whether this ledger holds network state yet
    pub fn is_synced(&self) -> bool {
        self.writer.lock().synced
    }

    /// Apply `delta` on top of the head. Caller holds the writer lock.
    /// Local writes also announce the mutation itself; remote ones are only
    /// announced as a block.
    fn commit(&self, delta: Delta, local: bool) -> Result<Arc<Block>, LedgerError> {
        let last = self.last_block();
        let mut storage = last.storage.clone();
        delta.apply(&mut storage);

        let block = self.append(last.next(storage))?;
        if local {
            self.broadcaster.broadcast(&Announcement::Mutation(delta));
        }
        Ok(block)
    }

    /// Store and announce a locally built successor of the head
    fn append(&self, block: Block) -> Result<Arc<Block>, LedgerError> {
        let block = Arc::new(block);
        self.store.append(&block)?;
        self.head.send_replace(block.clone());
        self.broadcaster.broadcast(&Announcement::Block((*block).clone()));
        Ok(block)
    }
}

fn non_zero(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(1))
}

/// Run `f` immediately and then every `interval` until cancelled
pub fn spawn_periodic<F, Fut>(cancel: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(non_zero(interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}
