//! Address leasing with liveness

use super::{eventually, TestNetwork, TestNode};
use crate::engine::{AddressSource, Engine, MemoryDevice, MemoryDeviceHandle};
use crate::protocol::{DHCP, DHCP_LEADER_KEY, MACHINES};
use crate::services::dhcp::lease_file;
use crate::services::{available_nodes, read_lease, AliveService, LeaseService};
use crate::types::Machine;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

async fn leasing_node(network: &TestNetwork, lease_dir: &Path) -> (TestNode, MemoryDeviceHandle) {
    let mut config = network.config();
    config.dhcp.enable = true;
    config.dhcp.lease_dir = lease_dir.to_path_buf();

    let node = network.node(config.clone());
    let (lease, address) = LeaseService::new(&config).unwrap();
    let (device, handle) = MemoryDevice::new(16);
    node.add_service(Arc::new(AliveService::new(config.alive.clone())));
    node.add_service(Arc::new(lease));
    node.add_service(Arc::new(Engine::with_device(
        config.interface.clone(),
        config.engine.clone(),
        AddressSource::Lease(address),
        Arc::new(device),
    )));
    (network.start(node).await, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_nodes_lease_distinct_addresses() {
    let network = TestNetwork::new();
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut nodes = Vec::new();
    for dir in &dirs {
        nodes.push(leasing_node(&network, dir.path()).await);
    }

    let ledgers: Vec<_> = nodes.iter().map(|(n, _)| n.node.ledger().clone()).collect();
    let converged = eventually(Duration::from_secs(30), || {
        let ledgers = ledgers.clone();
        async move {
            let complete = ledgers
                .iter()
                .all(|ledger| ledger.bucket(MACHINES).map_or(0, |b| b.len()) == 3);
            // Every peer sees the same routing table and the same leaser
            complete
                && ledgers
                    .windows(2)
                    .all(|pair| pair[0].bucket(MACHINES) == pair[1].bucket(MACHINES))
                && ledgers.windows(2).all(|pair| {
                    pair[0].get_value::<String>(DHCP, DHCP_LEADER_KEY)
                        == pair[1].get_value::<String>(DHCP, DHCP_LEADER_KEY)
                })
        }
    })
    .await;
    assert!(converged);

    let machines = nodes[0].0.node.ledger().bucket(MACHINES).unwrap();
    let owners: HashSet<String> = machines
        .values()
        .map(|value| value.decode::<Machine>().unwrap().peer_id)
        .collect();
    let expected: HashSet<String> = nodes.iter().map(|(n, _)| n.node.peer_id().to_string()).collect();
    assert_eq!(owners, expected);

    // A single leaser is marked, and it is one of us
    let leaser = ledgers[0].get_value::<String>(DHCP, DHCP_LEADER_KEY).unwrap();
    assert!(expected.contains(&leaser));
    for ledger in &ledgers {
        assert_eq!(ledger.get_value::<String>(DHCP, DHCP_LEADER_KEY).as_deref(), Some(leaser.as_str()));
    }
    for address in machines.keys() {
        assert!(address.starts_with("10.1.0."), "unexpected lease {}", address);
    }

    // Every node remembers its lease
    let key = network.connection.otp.crypto.key.clone();
    let leases: HashSet<String> = dirs
        .iter()
        .map(|dir| read_lease(dir.path(), &key).unwrap())
        .collect();
    assert_eq!(leases.len(), 3);

    assert_eq!(available_nodes(nodes[0].0.node.ledger(), Duration::from_secs(60)).len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remembered_lease_is_reused() {
    let network = TestNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(lease_file(dir.path(), &network.connection.otp.crypto.key), "10.1.0.42").unwrap();

    let (node, _device) = leasing_node(&network, dir.path()).await;
    let ledger = node.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.get_key(MACHINES, "10.1.0.42").is_some() }
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lone_node_does_not_lease() {
    let network = TestNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let (node, _device) = leasing_node(&network, dir.path()).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(node.node.ledger().bucket(MACHINES).is_none());
    assert_eq!(read_lease(dir.path(), &network.connection.otp.crypto.key), None);
}
