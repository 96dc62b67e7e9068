//! Core types for gossip and hub messaging

use crate::address_book::PeerAddresses;
use crate::identity::PeerId;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A message received on a gossip topic
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// Peer that originally published the message
    pub from: PeerId,
    pub data: Arc<Vec<u8>>,
}

/// Application payload plus free-form annotations, sealed before it hits
/// the gossip topic
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub annotations: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// A message delivered by the hub after unsealing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubMessage {
    /// Transport-level provenance, never taken from the payload
    pub sender: PeerId,
    pub payload: Vec<u8>,
    pub annotations: BTreeMap<String, String>,
}

impl HubMessage {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Frames exchanged on a WebSocket gossip connection
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub enum WireFrame {
    /// First frame on every connection, proves the peer identity
    Hello {
        peer: PeerId,
        /// Where other peers can dial us
        addresses: PeerAddresses,
        timestamp: i64,
        signature: Vec<u8>,
    },

    /// A topic message, flooded to every connection
    Publish {
        topic: String,
        origin: PeerId,
        nonce: u64,
        data: Vec<u8>,
        /// Origin's signature over the message id
        signature: Vec<u8>,
    },

    /// Topics the sender is subscribed to
    Topics { topics: Vec<String> },

    /// Known peer addresses, for discovery
    Peers { peers: Vec<(PeerId, PeerAddresses)> },
}

impl WireFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }

    /// Bytes the Hello signature covers
    pub fn hello_payload(peer: &PeerId, addresses: &PeerAddresses, timestamp: i64) -> Vec<u8> {
        let mut payload = b"meshvpn-hello".to_vec();
        payload.extend_from_slice(peer.as_bytes());
        payload.extend_from_slice(&borsh::to_vec(addresses).unwrap_or_default());
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload
    }

    /// Stable id of a published message, also what the origin signs
    pub fn message_id(topic: &str, origin: &PeerId, nonce: u64, data: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(topic.as_bytes());
        hasher.update(origin.as_bytes());
        hasher.update(&nonce.to_le_bytes());
        hasher.update(data);
        *hasher.finalize().as_bytes()
    }
}
