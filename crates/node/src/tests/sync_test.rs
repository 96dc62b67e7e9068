//! Ledger replication between nodes

use super::{eventually, TestNetwork};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_write_reaches_peer() {
    let network = TestNetwork::new();
    let a = network.spawn(network.config()).await;
    let b = network.spawn(network.config()).await;

    a.node.ledger().add_value("notes", "greeting", "hello").unwrap();

    let ledger = b.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.get_value::<String>("notes", "greeting").as_deref() == Some("hello") }
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_writes_converge() {
    let network = TestNetwork::new();
    let a = network.spawn(network.config()).await;
    let b = network.spawn(network.config()).await;

    for i in 0..5 {
        a.node.ledger().add_value("a", &i.to_string(), &i).unwrap();
        b.node.ledger().add_value("b", &i.to_string(), &i).unwrap();
    }

    let (la, lb) = (a.node.ledger().clone(), b.node.ledger().clone());
    assert!(
        eventually(Duration::from_secs(10), || {
            let (la, lb) = (la.clone(), lb.clone());
            async move {
                let complete = |ledger: &meshvpn_ledger::Ledger| {
                    ["a", "b"]
                        .iter()
                        .all(|bucket| ledger.bucket(bucket).map_or(0, |b| b.len()) == 5)
                };
                complete(&la) && complete(&lb)
            }
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_joiner_catches_up() {
    let network = TestNetwork::new();
    let a = network.spawn(network.config()).await;
    a.node.ledger().add_value("notes", "early", "before").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let late = network.spawn(network.config()).await;
    let ledger = late.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.get_value::<String>("notes", "early").as_deref() == Some("before") }
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_other_network_is_isolated() {
    let network = TestNetwork::new();
    let a = network.spawn(network.config()).await;

    // Same fabric, different secrets
    let mut other = network.config();
    other.connection = crate::config::ConnectionData::generate(9000);
    let stranger = network.spawn(other).await;

    a.node.ledger().add_value("notes", "secret", "x").unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(stranger.node.ledger().get_key("notes", "secret").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_survives_resync() {
    let network = TestNetwork::new();
    let a = network.spawn(network.config()).await;
    let b = network.spawn(network.config()).await;

    a.node.ledger().add_value("trustzone", "evicted", "").unwrap();
    let (la, lb) = (a.node.ledger().clone(), b.node.ledger().clone());
    assert!(
        eventually(Duration::from_secs(5), || {
            let lb = lb.clone();
            async move { lb.get_key("trustzone", "evicted").is_some() }
        })
        .await
    );

    b.node.ledger().delete("trustzone", "evicted").unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            let la = la.clone();
            async move { la.get_key("trustzone", "evicted").is_none() }
        })
        .await
    );

    // Several snapshot rounds later the key is still gone on both sides
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(la.get_key("trustzone", "evicted").is_none());
    assert!(lb.get_key("trustzone", "evicted").is_none());
}
