//! Topic-based gossip transport
//!
//! The hub only needs two things from the substrate: join a topic by name,
//! and publish/receive opaque bytes on it. Messages a peer publishes are
//! never delivered back to that same peer.

use crate::error::P2pError;
use crate::identity::PeerId;
use crate::message::GossipMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Buffered messages per topic subscription
pub const TOPIC_BUFFER: usize = 128;

/// Something that can put this peer on named gossip topics
#[async_trait]
pub trait GossipTransport: Send + Sync {
    fn local_id(&self) -> PeerId;

    /// Join a topic. Membership lasts as long as the returned handle.
    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, P2pError>;
}

/// Handle on a joined topic
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Publish to every other member
    async fn publish(&self, data: Vec<u8>) -> Result<(), P2pError>;

    /// Receive messages published by other members
    fn subscribe(&self) -> broadcast::Receiver<GossipMessage>;

    /// Other peers currently known on this topic
    fn peers(&self) -> Vec<PeerId>;
}

/// In-process gossip fabric shared by every peer in a test or simulation
#[derive(Clone, Default)]
pub struct MemoryGossipNetwork {
    topics: Arc<DashMap<String, DashMap<PeerId, Weak<MemoryTopicInner>>>>,
}

impl MemoryGossipNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport endpoint for `peer`
    pub fn transport(&self, peer: PeerId) -> MemoryGossip {
        MemoryGossip {
            network: self.clone(),
            peer,
        }
    }

    fn members(&self, topic: &str) -> Vec<(PeerId, Arc<MemoryTopicInner>)> {
        let Some(members) = self.topics.get(topic) else {
            return Vec::new();
        };
        members.retain(|_, weak| weak.strong_count() > 0);
        members
            .iter()
            .filter_map(|r| r.value().upgrade().map(|inner| (*r.key(), inner)))
            .collect()
    }
}

/// One peer's endpoint on a [`MemoryGossipNetwork`]
#[derive(Clone)]
pub struct MemoryGossip {
    network: MemoryGossipNetwork,
    peer: PeerId,
}

#[async_trait]
impl GossipTransport for MemoryGossip {
    fn local_id(&self) -> PeerId {
        self.peer
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, P2pError> {
        let members = self.network.topics.entry(topic.to_string()).or_default();
        if let Some(existing) = members.get(&self.peer).and_then(|w| w.upgrade()) {
            return Ok(existing);
        }

        let (tx, _) = broadcast::channel(TOPIC_BUFFER);
        let inner = Arc::new(MemoryTopicInner {
            name: topic.to_string(),
            peer: self.peer,
            tx,
            network: self.network.clone(),
        });
        members.insert(self.peer, Arc::downgrade(&inner));
        Ok(inner)
    }
}

struct MemoryTopicInner {
    name: String,
    peer: PeerId,
    tx: broadcast::Sender<GossipMessage>,
    network: MemoryGossipNetwork,
}

#[async_trait]
impl Topic for MemoryTopicInner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), P2pError> {
        let message = GossipMessage {
            from: self.peer,
            data: Arc::new(data),
        };
        for (peer, member) in self.network.members(&self.name) {
            if peer != self.peer {
                let _ = member.tx.send(message.clone());
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GossipMessage> {
        self.tx.subscribe()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.network
            .members(&self.name)
            .into_iter()
            .map(|(peer, _)| peer)
            .filter(|peer| *peer != self.peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_others_not_self() {
        let network = MemoryGossipNetwork::new();
        let a = network.transport(Keypair::generate().peer_id());
        let b = network.transport(Keypair::generate().peer_id());

        let topic_a = a.join("room").await.unwrap();
        let topic_b = b.join("room").await.unwrap();
        let mut rx_a = topic_a.subscribe();
        let mut rx_b = topic_b.subscribe();

        topic_a.publish(b"hello".to_vec()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(got.from, a.local_id());
        assert_eq!(got.data.as_slice(), b"hello");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let network = MemoryGossipNetwork::new();
        let a = network.transport(Keypair::generate().peer_id());
        let b = network.transport(Keypair::generate().peer_id());

        let topic_a = a.join("one").await.unwrap();
        let topic_b = b.join("two").await.unwrap();
        let mut rx_b = topic_b.subscribe();

        topic_a.publish(b"hello".to_vec()).await.unwrap();
        assert!(rx_b.try_recv().is_err());
        assert!(topic_a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_handle_leaves_topic() {
        let network = MemoryGossipNetwork::new();
        let a = network.transport(Keypair::generate().peer_id());
        let b = network.transport(Keypair::generate().peer_id());

        let topic_a = a.join("room").await.unwrap();
        let topic_b = b.join("room").await.unwrap();
        assert_eq!(topic_a.peers(), vec![b.local_id()]);

        drop(topic_b);
        assert!(topic_a.peers().is_empty());
    }
}
