//! Ed25519 auth provider
//!
//! A peer outside the trust zone signs the SHA-256 of its own peer id with
//! the shared private key and sends the signature in the `sigs` annotation.
//! Receivers verify it against every `trustzoneAuth` key naming ed25519.

use crate::error::ConfigError;
use crate::trustzone::guardian::AuthProvider;
use meshvpn_ledger::Bucket;
use meshvpn_p2p::{Envelope, HubMessage, Keypair, PeerId};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const SIGNATURE_ANNOTATION: &str = "sigs";
const CHALLENGE: &[u8] = b"challenge";

pub struct Ed25519Provider {
    keypair: Keypair,
}

impl Ed25519Provider {
    pub const NAME: &'static str = "ed25519";

    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    /// Build from config options; `private_key` (base58) is required
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let missing = || ConfigError::MissingProviderOption {
            provider: Self::NAME.to_string(),
            option: "private_key".to_string(),
        };
        let private = options.get("private_key").filter(|k| !k.is_empty()).ok_or_else(missing)?;
        let keypair = Keypair::from_base58(private)
            .map_err(|e| ConfigError::Invalid(format!("ed25519 private_key: {}", e)))?;
        Ok(Self::new(keypair))
    }

    /// New (private, public) key pair, both base58
    pub fn generate_keys() -> (String, String) {
        let keypair = Keypair::generate();
        (keypair.to_base58(), keypair.peer_id().to_string())
    }

    pub fn public_key(&self) -> String {
        self.keypair.peer_id().to_string()
    }
}

fn digest(peer: &PeerId) -> [u8; 32] {
    Sha256::digest(peer.to_string().as_bytes()).into()
}

impl AuthProvider for Ed25519Provider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn challenge(&self, local: &PeerId) -> Option<Envelope> {
        let signature = self.keypair.sign(&digest(local));
        Some(Envelope::new(CHALLENGE.to_vec()).with_annotation(SIGNATURE_ANNOTATION, bs58::encode(signature).into_string()))
    }

    fn authenticate(&self, message: &HubMessage, auth: &Bucket) -> bool {
        let Some(signature) = message
            .annotation(SIGNATURE_ANNOTATION)
            .and_then(|s| bs58::decode(s).into_vec().ok())
        else {
            return false;
        };
        let digest = digest(&message.sender);

        auth.iter()
            .filter(|(key, _)| key.contains(Self::NAME))
            .filter_map(|(_, value)| value.as_string())
            .filter_map(|public| public.parse::<PeerId>().ok())
            .any(|public| public.verify(&digest, &signature))
    }
}
