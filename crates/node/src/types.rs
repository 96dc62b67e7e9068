//! Values stored in the ledger buckets

use serde::{Deserialize, Serialize};

/// A routing table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub peer_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub address: String,
}

impl Machine {
    /// Entry describing this host
    pub fn local(peer_id: String, address: String) -> Self {
        Self {
            peer_id,
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub peer_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub peer_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub peer_id: String,
    pub timestamp: String,
}

pub(crate) fn hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_carries_hostname() {
        let machine = Machine::local("peer-a".to_string(), "10.1.0.1".to_string());
        assert_eq!(machine.hostname, hostname());
        assert!(!machine.hostname.is_empty());
        assert_eq!(machine.hostname, machine.hostname.trim());
    }
}
