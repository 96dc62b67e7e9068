//! Address leasing
//!
//! Nodes without an address agree on one leaser: the leader of the live
//! nodes that have no `machines` entry yet. The leaser marks itself in
//! `dhcp/leader`, picks the next free address and hands it to the frame
//! engine; once its machine entry shows up the next node takes over.
//! Leases survive restarts in a file named after the exchange key.

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::node::{NetworkService, NodeContext};
use crate::protocol::{DHCP, DHCP_LEADER_KEY, MACHINES};
use crate::services::alive::available_nodes;
use crate::services::leader::{leader, next_ip};
use crate::types::Machine;
use async_trait::async_trait;
use meshvpn_ledger::Data;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;

/// Lease file for a network, keyed by its exchange key
pub fn lease_file(dir: &Path, exchange_key: &str) -> PathBuf {
    dir.join(hex::encode(Sha256::digest(format!("{}-ek", exchange_key).as_bytes())))
}

/// Address leased in a previous run, if any
pub fn read_lease(dir: &Path, exchange_key: &str) -> Option<String> {
    std::fs::read_to_string(lease_file(dir, exchange_key))
        .ok()
        .map(|lease| lease.trim().to_string())
        .filter(|lease| !lease.is_empty())
}

pub struct LeaseService {
    lease_dir: PathBuf,
    exchange_key: String,
    default_address: String,
    poll: Duration,
    max: Duration,
    lease: Mutex<Option<oneshot::Sender<String>>>,
}

impl LeaseService {
    /// The receiver yields the leased address once
    pub fn new(config: &NodeConfig) -> Result<(Self, oneshot::Receiver<String>), NodeError> {
        let (tx, rx) = oneshot::channel();
        let service = Self {
            lease_dir: config.dhcp.lease_dir.clone(),
            exchange_key: config.connection.otp.crypto.key.clone(),
            default_address: config.interface_ip()?.to_string(),
            poll: config.dhcp.poll_interval,
            max: config.alive.max,
            lease: Mutex::new(Some(tx)),
        };
        Ok((service, rx))
    }

    /// One leasing round; `Some` when we hold the lease
    async fn attempt(&self, ctx: &NodeContext) -> Option<String> {
        let local = ctx.peer_id.to_string();
        let nodes = available_nodes(&ctx.ledger, self.max);

        let machines: Vec<Machine> = ctx
            .ledger
            .bucket(MACHINES)
            .unwrap_or_default()
            .values()
            .filter_map(|value| value.decode::<Machine>().ok())
            .collect();
        let with_address: HashSet<&str> = machines.iter().map(|m| m.peer_id.as_str()).collect();
        let used: Vec<&str> = machines.iter().map(|m| m.address.as_str()).collect();
        let without_address: Vec<String> = nodes
            .iter()
            .filter(|node| !with_address.contains(node.as_str()))
            .cloned()
            .collect();

        if nodes.len() <= 1 {
            tracing::debug!("Not enough nodes to lease an address");
            return None;
        }

        let should_lead = leader(&without_address).unwrap_or_default();
        let marked = ctx
            .ledger
            .get_value::<String>(DHCP, DHCP_LEADER_KEY)
            .unwrap_or_default();

        if should_lead != local && marked != local {
            tracing::debug!("Not leasing, leader is {}", should_lead);
            return None;
        }

        if should_lead == local && (marked.is_empty() || !without_address.contains(&marked)) {
            tracing::info!("Marking ourselves as address leaser");
            let result = ctx
                .ledger
                .persist(
                    &ctx.cancel,
                    self.poll,
                    self.poll * 3,
                    DHCP,
                    DHCP_LEADER_KEY,
                    Data::string(&local),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!("Failed to mark leaser: {}", e);
            }
            return None;
        }

        if marked != local {
            tracing::debug!("Backing off, {} is marked as leaser", marked);
            return None;
        }

        Some(next_ip(&self.default_address, &used))
    }
}

#[async_trait]
impl NetworkService for LeaseService {
    fn name(&self) -> &str {
        "dhcp"
    }

    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        std::fs::create_dir_all(&self.lease_dir)?;

        let lease = match read_lease(&self.lease_dir, &self.exchange_key) {
            Some(lease) => lease,
            None => loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
                    _ = tokio::time::sleep(self.poll) => {}
                }
                if let Some(lease) = self.attempt(&ctx).await {
                    break lease;
                }
            },
        };

        let path = lease_file(&self.lease_dir, &self.exchange_key);
        tracing::info!("Leased {}, writing {:?}", lease, path);
        if let Err(e) = std::fs::write(&path, &lease) {
            tracing::warn!("Failed to write lease: {}", e);
        }

        if let Some(tx) = self.lease.lock().take() {
            let _ = tx.send(lease);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_lease(dir.path(), "key"), None);

        let path = lease_file(dir.path(), "key");
        assert_eq!(path.file_name().unwrap().len(), 64);
        assert_ne!(path, lease_file(dir.path(), "other"));

        std::fs::write(&path, "10.1.0.4\n").unwrap();
        assert_eq!(read_lease(dir.path(), "key").as_deref(), Some("10.1.0.4"));
    }
}
