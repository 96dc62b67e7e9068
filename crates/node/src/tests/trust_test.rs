//! Trust zone admission across nodes

use super::{eventually, TestNetwork};
use crate::protocol::{TRUSTZONE, TRUSTZONE_AUTH};
use crate::trustzone::Ed25519Provider;
use std::collections::BTreeMap;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_strict_gate_drops_untrusted_writes() {
    let network = TestNetwork::new();
    let mut strict = network.config();
    strict.trust_zone.gate = true;
    let a = network.spawn(strict).await;
    let b = network.spawn(network.config()).await;

    b.node.ledger().add_value("notes", "k", "v").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(a.node.ledger().get_key("notes", "k").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relaxed_gate_passes_while_zone_is_empty() {
    let network = TestNetwork::new();
    let mut relaxed = network.config();
    relaxed.trust_zone.gate = true;
    relaxed.trust_zone.relaxed = true;
    let a = network.spawn(relaxed).await;
    let b = network.spawn(network.config()).await;

    b.node.ledger().add_value("notes", "k", "v").unwrap();
    let ledger = a.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.get_key("notes", "k").is_some() }
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trusted_peer_passes_strict_gate() {
    let network = TestNetwork::new();
    let mut strict = network.config();
    strict.trust_zone.gate = true;
    let a = network.spawn(strict).await;
    let b = network.spawn(network.config()).await;

    a.node
        .ledger()
        .add_value(TRUSTZONE, &b.node.peer_id().to_string(), "")
        .unwrap();
    let gater = a.node.gater().clone();
    assert!(eventually(Duration::from_secs(2), || {
        let gater = gater.clone();
        async move { gater.trusted_len() == 1 }
    })
    .await);

    b.node.ledger().add_value("notes", "k", "v").unwrap();
    let ledger = a.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.get_key("notes", "k").is_some() }
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guardian_admits_signed_peer() {
    let network = TestNetwork::new();
    let (private, public) = Ed25519Provider::generate_keys();
    let mut providers = BTreeMap::new();
    providers.insert(
        Ed25519Provider::NAME.to_string(),
        BTreeMap::from([("private_key".to_string(), private)]),
    );

    let mut verifier = network.config();
    verifier.trust_zone.enable = true;
    verifier.trust_zone.auth_providers = providers.clone();
    verifier
        .trust_zone
        .authorized_keys
        .insert(Ed25519Provider::NAME.to_string(), public.clone());
    let a = network.spawn(verifier).await;

    let mut member = network.config();
    member.trust_zone.enable = true;
    member.trust_zone.auth_providers = providers;
    let b = network.spawn(member).await;

    let expected = b.node.peer_id().to_string();
    let ledger = a.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(10), || {
            let ledger = ledger.clone();
            let expected = expected.clone();
            async move { ledger.get_key(TRUSTZONE, &expected).is_some() }
        })
        .await
    );
    assert_eq!(
        a.node.ledger().get_value::<String>(TRUSTZONE_AUTH, Ed25519Provider::NAME),
        Some(public)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guardian_ignores_wrong_key() {
    let network = TestNetwork::new();
    let (_, public) = Ed25519Provider::generate_keys();
    let (other_private, _) = Ed25519Provider::generate_keys();

    let mut verifier = network.config();
    verifier.trust_zone.enable = true;
    verifier.trust_zone.auth_providers = BTreeMap::from([(
        Ed25519Provider::NAME.to_string(),
        BTreeMap::from([("private_key".to_string(), other_private.clone())]),
    )]);
    verifier
        .trust_zone
        .authorized_keys
        .insert(Ed25519Provider::NAME.to_string(), public);
    let a = network.spawn(verifier.clone()).await;
    let b = network.spawn(verifier).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(a
        .node
        .ledger()
        .get_key(TRUSTZONE, &b.node.peer_id().to_string())
        .is_none());
}
