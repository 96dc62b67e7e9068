//! Where known peers can be dialed

use crate::identity::PeerId;
use borsh::{BorshDeserialize, BorshSerialize};
use dashmap::DashMap;
use std::sync::Arc;

/// Dialable endpoints of one peer
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PeerAddresses {
    /// WebSocket gossip listener, `host:port`
    pub gossip: Option<String>,
    /// Peer stream listener, `host:port`
    pub stream: Option<String>,
}

/// Shared map of peer id to addresses, fed by gossip handshakes and peer
/// exchange, read by the stream transport when dialing
#[derive(Clone, Default)]
pub struct AddressBook {
    entries: Arc<DashMap<PeerId, PeerAddresses>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record addresses for a peer, keeping known fields the update lacks
    pub fn insert(&self, peer: PeerId, addresses: PeerAddresses) {
        let mut entry = self.entries.entry(peer).or_default();
        if addresses.gossip.is_some() {
            entry.gossip = addresses.gossip;
        }
        if addresses.stream.is_some() {
            entry.stream = addresses.stream;
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerAddresses> {
        self.entries.get(peer).map(|r| r.value().clone())
    }

    pub fn stream_addr(&self, peer: &PeerId) -> Option<String> {
        self.entries.get(peer).and_then(|r| r.value().stream.clone())
    }

    pub fn remove(&self, peer: &PeerId) {
        self.entries.remove(peer);
    }

    /// Snapshot of every entry
    pub fn all(&self) -> Vec<(PeerId, PeerAddresses)> {
        self.entries
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn test_insert_merges_fields() {
        let book = AddressBook::new();
        let peer = Keypair::generate().peer_id();

        book.insert(
            peer,
            PeerAddresses {
                gossip: Some("10.0.0.1:4001".to_string()),
                stream: None,
            },
        );
        book.insert(
            peer,
            PeerAddresses {
                gossip: None,
                stream: Some("10.0.0.1:4002".to_string()),
            },
        );

        let entry = book.get(&peer).unwrap();
        assert_eq!(entry.gossip.as_deref(), Some("10.0.0.1:4001"));
        assert_eq!(book.stream_addr(&peer).as_deref(), Some("10.0.0.1:4002"));
        assert_eq!(book.len(), 1);
    }
}
