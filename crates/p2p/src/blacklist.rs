//! Peer and network deny list

use crate::error::P2pError;
use crate::identity::PeerId;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

/// An IP network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            network: addr,
            prefix: prefix.min(max),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for Cidr {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || P2pError::InvalidPeerId(format!("{} is not a network", s));
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Ok(Self::new(addr, prefix))
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| invalid())?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                Ok(Self::new(addr, prefix))
            }
        }
    }
}

/// Peers and networks that may never talk to us
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    peers: HashSet<PeerId>,
    networks: Vec<Cidr>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config entries; each is a peer id, an IP or a CIDR
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, P2pError> {
        let mut blacklist = Self::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if let Ok(cidr) = entry.parse::<Cidr>() {
                blacklist.networks.push(cidr);
            } else {
                blacklist.peers.insert(entry.parse()?);
            }
        }
        Ok(blacklist)
    }

    pub fn block_peer(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    pub fn block_network(&mut self, network: Cidr) {
        self.networks.push(network);
    }

    pub fn blocks_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn blocks_addr(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|n| n.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn test_cidr_contains() {
        let net: Cidr = "10.1.0.0/24".parse().unwrap();
        assert!(net.contains(&"10.1.0.42".parse().unwrap()));
        assert!(!net.contains(&"10.1.1.1".parse().unwrap()));
        assert!(!net.contains(&"::1".parse().unwrap()));

        let host: Cidr = "192.168.1.5".parse().unwrap();
        assert!(host.contains(&"192.168.1.5".parse().unwrap()));
        assert!(!host.contains(&"192.168.1.6".parse().unwrap()));

        let all: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_parse_mixed_entries() {
        let peer = Keypair::generate().peer_id();
        let blacklist = Blacklist::parse(&[peer.to_string(), "10.1.0.1/24".to_string()]).unwrap();
        assert!(blacklist.blocks_peer(&peer));
        assert!(!blacklist.blocks_peer(&Keypair::generate().peer_id()));
        assert!(blacklist.blocks_addr(&"10.1.0.200".parse().unwrap()));
        assert!(Blacklist::parse(&["garbage"]).is_err());
    }
}
