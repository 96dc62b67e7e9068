//! Time-windowed shared secrets
//!
//! Both the gossip topic names and the payload sealing keys are derived from
//! a secret that only members of the network know, mixed with the current
//! time window. Peers whose clocks agree within a window land on the same
//! topic and the same key without talking to each other first.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// A shared secret rotating every `interval` seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpKey {
    pub key: String,
    /// Window length in seconds
    pub interval: u64,
    /// Hex characters kept from each window token
    pub length: usize,
}

impl OtpKey {
    pub fn new(key: impl Into<String>, interval: u64, length: usize) -> Self {
        Self {
            key: key.into(),
            interval,
            length,
        }
    }

    /// Index of the window containing `unix_secs`
    pub fn window(&self, unix_secs: u64) -> u64 {
        unix_secs / self.interval.max(1)
    }

    /// Token for a given window
    pub fn token_for_window(&self, window: u64) -> String {
        let digest = match HmacSha256::new_from_slice(self.key.as_bytes()) {
            Ok(mut mac) => {
                mac.update(&window.to_be_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            // HMAC accepts keys of any length
            Err(_) => Sha256::digest(self.key.as_bytes()).to_vec(),
        };
        let mut token = hex::encode(digest);
        token.truncate(self.length.clamp(1, 64));
        token
    }

    /// Token for the window containing `unix_secs`
    pub fn token_at(&self, unix_secs: u64) -> String {
        self.token_for_window(self.window(unix_secs))
    }

    pub fn current_window(&self) -> u64 {
        self.window(now_secs())
    }

    /// Gossip topic for a window, optionally namespaced by salts
    pub fn topic_for_window(&self, window: u64, salts: &[&str]) -> String {
        hex::encode(Sha256::digest(salted(&self.token_for_window(window), salts)))
    }

    /// 32 byte symmetric key for a window
    pub fn seal_key_for_window(&self, window: u64, salts: &[&str]) -> [u8; 32] {
        Sha256::digest(salted(&self.token_for_window(window), salts)).into()
    }
}

fn salted(token: &str, salts: &[&str]) -> Vec<u8> {
    let mut input = token.to_string();
    for salt in salts {
        input.push(':');
        input.push_str(salt);
    }
    input.into_bytes()
}

/// Seconds since the unix epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
