//! Sender admission for the ledger room

use crate::protocol::TRUSTZONE;
use meshvpn_ledger::Ledger;
use meshvpn_p2p::PeerId;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Never gate
    Disabled,
    /// Gate everyone outside the trust set
    Strict,
    /// Like strict, but let everyone through while the trust set is empty
    Relaxed,
}

#[derive(Debug)]
struct GaterState {
    enabled: bool,
    trusted: HashSet<String>,
}

#[derive(Debug)]
pub struct PeerGater {
    mode: GateMode,
    state: RwLock<GaterState>,
}

impl PeerGater {
    pub fn new(mode: GateMode) -> Self {
        Self {
            mode,
            state: RwLock::new(GaterState {
                enabled: mode != GateMode::Disabled,
                trusted: HashSet::new(),
            }),
        }
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    pub fn enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn enable(&self) {
        self.state.write().enabled = true;
    }

    pub fn disable(&self) {
        self.state.write().enabled = false;
    }

    /// True when messages from `peer` must be dropped
    pub fn gate(&self, peer: &PeerId) -> bool {
        let state = self.state.read();
        if !state.enabled {
            return false;
        }
        if self.mode == GateMode::Relaxed && state.trusted.is_empty() {
            return false;
        }
        !state.trusted.contains(&peer.to_string())
    }

    /// Replace the trust set
    pub fn set_trusted<I: IntoIterator<Item = String>>(&self, peers: I) {
        self.state.write().trusted = peers.into_iter().collect();
    }

    pub fn trusted_len(&self) -> usize {
        self.state.read().trusted.len()
    }

    /// Keep the trust set in line with the `trustzone` bucket
    pub fn updater(self: &Arc<Self>, cancel: CancellationToken, interval: Duration, ledger: Arc<Ledger>) -> JoinHandle<()> {
        let gater = self.clone();
        let reader = ledger.clone();
        ledger.announce(cancel, interval, move || {
            let trusted = reader
                .bucket(TRUSTZONE)
                .map(|bucket| bucket.into_keys().collect::<Vec<_>>())
                .unwrap_or_default();
            gater.set_trusted(trusted);
            async {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvpn_ledger::{MemoryStore, NoopBroadcaster};
    use meshvpn_p2p::Keypair;

    #[test]
    fn test_strict_gates_unknown() {
        let gater = PeerGater::new(GateMode::Strict);
        let trusted = Keypair::generate().peer_id();
        let stranger = Keypair::generate().peer_id();

        assert!(gater.gate(&stranger));
        gater.set_trusted([trusted.to_string()]);
        assert!(!gater.gate(&trusted));
        assert!(gater.gate(&stranger));
    }

    #[test]
    fn test_relaxed_passes_while_empty() {
        let gater = PeerGater::new(GateMode::Relaxed);
        let trusted = Keypair::generate().peer_id();
        let stranger = Keypair::generate().peer_id();

        assert!(!gater.gate(&stranger));
        gater.set_trusted([trusted.to_string()]);
        assert!(gater.gate(&stranger));
        assert!(!gater.gate(&trusted));
    }

    #[test]
    fn test_disable_and_enable() {
        let gater = PeerGater::new(GateMode::Strict);
        let stranger = Keypair::generate().peer_id();
        gater.disable();
        assert!(!gater.enabled());
        assert!(!gater.gate(&stranger));
        gater.enable();
        assert!(gater.gate(&stranger));

        let disabled = PeerGater::new(GateMode::Disabled);
        assert!(!disabled.gate(&stranger));
    }

    #[tokio::test]
    async fn test_updater_copies_trustzone() {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), Arc::new(NoopBroadcaster)).unwrap());
        let peer = Keypair::generate().peer_id();
        ledger.add_value(TRUSTZONE, &peer.to_string(), "").unwrap();

        let gater = Arc::new(PeerGater::new(GateMode::Strict));
        let cancel = CancellationToken::new();
        gater.updater(cancel.clone(), Duration::from_millis(10), ledger.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gater.trusted_len(), 1);
        assert!(!gater.gate(&peer));
        cancel.cancel();
    }
}
