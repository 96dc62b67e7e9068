//! Peer guardian: admits peers into the trust zone once they prove
//! possession of an authorized key

use crate::error::ConfigError;
use crate::node::NodeContext;
use crate::protocol::{TRUSTZONE, TRUSTZONE_AUTH};
use crate::trustzone::ed25519::Ed25519Provider;
use meshvpn_ledger::{Bucket, Data, DEFAULT_PERSIST_RETRY_SECS};
use meshvpn_p2p::{Channel, Envelope, HubMessage, PeerId};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long a trust zone admission keeps retrying
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(120);

/// A way for peers to prove they belong in the trust zone
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Proof broadcast on the generic room by a peer outside the trust zone
    fn challenge(&self, local: &PeerId) -> Option<Envelope>;

    /// Check a received proof against the `trustzoneAuth` bucket
    fn authenticate(&self, message: &HubMessage, auth: &Bucket) -> bool;
}

/// Instantiate the configured providers; unknown names and missing options
/// are fatal
pub fn build_providers(
    config: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<Vec<Arc<dyn AuthProvider>>, ConfigError> {
    config
        .iter()
        .map(|(name, options)| -> Result<Arc<dyn AuthProvider>, ConfigError> {
            match name.as_str() {
                Ed25519Provider::NAME => Ok(Arc::new(Ed25519Provider::from_options(options)?)),
                other => Err(ConfigError::UnknownAuthProvider(other.to_string())),
            }
        })
        .collect()
}

pub struct PeerGuardian {
    providers: Vec<Arc<dyn AuthProvider>>,
    autoclean: bool,
    interval: Duration,
}

impl PeerGuardian {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>, autoclean: bool, interval: Duration) -> Self {
        Self {
            providers,
            autoclean,
            interval,
        }
    }

    /// Periodically prove ourselves while outside the trust zone, and drop
    /// trust zone entries of peers that left when autoclean is on
    pub fn challenger(self: &Arc<Self>, ctx: NodeContext) -> JoinHandle<()> {
        let guardian = self.clone();
        let ledger = ctx.ledger.clone();
        ledger.announce(ctx.cancel.clone(), self.interval, move || {
            let guardian = guardian.clone();
            let ctx = ctx.clone();
            async move {
                let local = ctx.peer_id.to_string();
                let trusted = ctx.ledger.get_key(TRUSTZONE, &local).is_some();

                if !trusted {
                    for provider in &guardian.providers {
                        let Some(challenge) = provider.challenge(&ctx.peer_id) else {
                            continue;
                        };
                        if let Err(e) = ctx.hub.publish_generic(challenge).await {
                            tracing::warn!("{} challenge failed: {}", provider.name(), e);
                        }
                    }
                }

                if guardian.autoclean {
                    guardian.clean(&ctx);
                }
            }
        })
    }

    fn clean(&self, ctx: &NodeContext) {
        let Some(zone) = ctx.ledger.bucket(TRUSTZONE) else {
            return;
        };
        let mut present: HashSet<String> = ctx
            .hub
            .peers(Channel::Generic)
            .iter()
            .map(|p| p.to_string())
            .collect();
        present.insert(ctx.peer_id.to_string());

        for peer in zone.keys().filter(|peer| !present.contains(*peer)) {
            tracing::info!("Removing {} from the trust zone", peer);
            if let Err(e) = ctx.ledger.delete(TRUSTZONE, peer) {
                tracing::warn!("Failed to remove {}: {}", peer, e);
            }
        }
    }

    /// Generic room handler: admit the sender when any provider accepts its
    /// proof
    pub fn receive(&self, ctx: &NodeContext, message: &HubMessage) {
        let sender = message.sender.to_string();
        if ctx.ledger.get_key(TRUSTZONE, &sender).is_some() {
            return;
        }
        let auth = ctx.ledger.bucket(TRUSTZONE_AUTH).unwrap_or_default();
        if auth.is_empty() {
            return;
        }

        let Some(provider) = self.providers.iter().find(|p| p.authenticate(message, &auth)) else {
            tracing::debug!("No provider accepted {}", message.sender.short());
            return;
        };
        tracing::info!("{} authenticated {}", provider.name(), message.sender.short());

        let ledger = ctx.ledger.clone();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            let result = ledger
                .persist(
                    &cancel,
                    Duration::from_secs(DEFAULT_PERSIST_RETRY_SECS),
                    ADMISSION_TIMEOUT,
                    TRUSTZONE,
                    &sender,
                    Data::string(""),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!("Failed to admit {}: {}", sender, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_providers() {
        let (private, _) = Ed25519Provider::generate_keys();
        let mut config = BTreeMap::new();
        let mut options = BTreeMap::new();
        options.insert("private_key".to_string(), private);
        config.insert("ed25519".to_string(), options);
        let providers = build_providers(&config).unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "ed25519");

        config.insert("ed25519".to_string(), BTreeMap::new());
        assert!(matches!(
            build_providers(&config),
            Err(ConfigError::MissingProviderOption { .. })
        ));

        config.clear();
        config.insert("ecdsa".to_string(), BTreeMap::new());
        assert!(matches!(build_providers(&config), Err(ConfigError::UnknownAuthProvider(_))));
    }
}
