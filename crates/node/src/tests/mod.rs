//! Multi-node tests on in-memory transports

mod alive_test;
mod leasing_test;
mod sharing_test;
mod sync_test;
mod trust_test;

use crate::config::{ConnectionData, NodeConfig};
use crate::node::{Node, NodeParts};
use meshvpn_ledger::MemoryStore;
use meshvpn_p2p::{Keypair, MemoryGossipNetwork, MemoryStreamNetwork};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One simulated network: shared secrets plus the in-memory fabric
pub(crate) struct TestNetwork {
    pub connection: ConnectionData,
    pub gossip: MemoryGossipNetwork,
    pub streams: MemoryStreamNetwork,
    pub cancel: CancellationToken,
}

/// A started node and its tasks
pub(crate) struct TestNode {
    pub node: Node,
    pub tasks: Vec<JoinHandle<()>>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            connection: ConnectionData::generate(9000),
            gossip: MemoryGossipNetwork::new(),
            streams: MemoryStreamNetwork::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Config with intervals short enough for tests
    pub fn config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(self.connection.clone());
        config.ledger.announce_interval = Duration::from_millis(100);
        config.ledger.sync_interval = Duration::from_millis(200);
        config.alive.announce = Duration::from_millis(100);
        config.alive.scrub = Duration::from_secs(3600);
        config.alive.max = Duration::from_secs(60);
        config.trust_zone.sync_interval = Duration::from_millis(100);
        config.dhcp.poll_interval = Duration::from_millis(500);
        config.engine.concurrency = 2;
        config
    }

    /// Build a node without starting it
    pub fn node(&self, config: NodeConfig) -> Node {
        self.node_with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Build a node on a store the test keeps a handle to
    pub fn node_with_store(&self, config: NodeConfig, store: Arc<MemoryStore>) -> Node {
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();
        Node::new(
            config,
            NodeParts {
                keypair,
                gossip: Arc::new(self.gossip.transport(peer)),
                streams: Arc::new(self.streams.transport(peer)),
                store,
            },
        )
        .unwrap()
    }

    pub async fn start(&self, node: Node) -> TestNode {
        let tasks = node.start(self.cancel.clone()).await.unwrap();
        TestNode { node, tasks }
    }

    pub async fn spawn(&self, config: NodeConfig) -> TestNode {
        self.start(self.node(config)).await
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll `check` until it holds or `timeout` passes
pub(crate) async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
