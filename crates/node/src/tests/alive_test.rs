//! Heartbeats and healthcheck scrubbing across nodes

use super::{eventually, TestNetwork, TestNode};
use crate::protocol::HEALTHCHECK;
use crate::services::AliveService;
use meshvpn_ledger::{BlockStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

async fn alive_node(network: &TestNetwork, scrub: Duration) -> (TestNode, Arc<MemoryStore>) {
    let mut config = network.config();
    config.alive.scrub = scrub;
    let store = Arc::new(MemoryStore::new());
    let node = network.node_with_store(config.clone(), store.clone());
    node.add_service(Arc::new(AliveService::new(config.alive.clone())));
    (network.start(node).await, store)
}

fn healthchecks(store: &MemoryStore) -> Vec<usize> {
    let last = store.last_index().unwrap_or(0);
    (1..=last)
        .filter_map(|index| store.read(index).ok().flatten())
        .map(|block| block.storage.get(HEALTHCHECK).map_or(0, |b| b.len()))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeats_reach_every_node() {
    let network = TestNetwork::new();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(alive_node(&network, Duration::from_secs(3600)).await);
    }

    let ledgers: Vec<_> = nodes.iter().map(|(n, _)| n.node.ledger().clone()).collect();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledgers = ledgers.clone();
            async move {
                ledgers
                    .iter()
                    .all(|l| crate::services::available_nodes(l, Duration::from_secs(60)).len() == 3)
            }
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scrub_drops_bucket_and_nodes_reannounce() {
    let network = TestNetwork::new();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(alive_node(&network, Duration::from_millis(300)).await);
    }
    let (node, store) = &nodes[0];

    // The history shows the bucket full, then dropped, then filled again
    let scrubbed = eventually(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            let history = healthchecks(&store);
            let Some(full) = history.iter().position(|&n| n == 3) else {
                return false;
            };
            let Some(dropped) = history[full..].iter().position(|&n| n == 0) else {
                return false;
            };
            history[full + dropped..].iter().any(|&n| n > 0)
        }
    })
    .await;
    assert!(scrubbed);

    let ledger = node.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.bucket(HEALTHCHECK).is_some_and(|b| !b.is_empty()) }
        })
        .await
    );
}
