//! Node configuration
//!
//! Peers of one network share a `ConnectionData` document (the secrets the
//! rooms and sealing keys derive from), handed around either as a YAML file
//! or as a base64 token. Everything else is local to the node and validated
//! once, before the node joins the network.

use crate::error::ConfigError;
use crate::trustzone;
use base64::Engine as _;
use meshvpn_p2p::{Blacklist, Cidr, HubConfig, OtpKey, PeerAddresses};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default OTP window, in seconds
pub const DEFAULT_OTP_INTERVAL: u64 = 9000;
/// 20 MiB
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 20 << 20;
const DEFAULT_KEY_LENGTH: usize = 32;
const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpConfig {
    pub interval: u64,
    pub key: String,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Otp {
    pub dht: OtpConfig,
    pub crypto: OtpConfig,
}

/// The shared network document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub otp: Otp,
    pub room: String,
    pub rendezvous: String,
    pub mdns: String,
    pub max_message_size: usize,
}

impl ConnectionData {
    /// Fresh random secrets rotating every `interval` seconds
    pub fn generate(interval: u64) -> Self {
        let otp = || OtpConfig {
            interval,
            key: random_secret(DEFAULT_KEY_LENGTH),
            length: DEFAULT_KEY_LENGTH,
        };
        Self {
            otp: Otp {
                dht: otp(),
                crypto: otp(),
            },
            room: random_secret(DEFAULT_KEY_LENGTH),
            rendezvous: random_secret(DEFAULT_KEY_LENGTH),
            mdns: random_secret(DEFAULT_KEY_LENGTH),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// base64 of the YAML document
    pub fn to_token(&self) -> Result<String, ConfigError> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.to_yaml()?))
    }

    pub fn from_token(token: &str) -> Result<Self, ConfigError> {
        let yaml = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|e| ConfigError::InvalidToken(e.to_string()))?;
        let yaml = String::from_utf8(yaml).map_err(|e| ConfigError::InvalidToken(e.to_string()))?;
        Self::from_yaml(&yaml).map_err(|e| ConfigError::InvalidToken(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Resolve from a token or a file, the file taking precedence
    pub fn load(token: Option<&str>, file: Option<&Path>) -> Result<Self, ConfigError> {
        match (file, token.filter(|t| !t.trim().is_empty())) {
            (Some(path), _) => Self::from_file(path),
            (None, Some(token)) => Self::from_token(token),
            (None, None) => Err(ConfigError::MissingNetwork),
        }
    }

    /// Secret the room topic names derive from
    pub fn room_otp(&self) -> OtpKey {
        OtpKey::new(self.room.clone(), self.otp.crypto.interval, self.otp.crypto.length)
    }

    /// Secret the sealing keys derive from
    pub fn exchange_otp(&self) -> OtpKey {
        OtpKey::new(
            self.otp.crypto.key.clone(),
            self.otp.crypto.interval,
            self.otp.crypto.length,
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.room.is_empty() || self.otp.crypto.key.is_empty() {
            return Err(ConfigError::Invalid("room and crypto key must not be empty".to_string()));
        }
        if self.otp.crypto.interval == 0 || self.otp.crypto.length == 0 {
            return Err(ConfigError::Invalid("crypto interval and length must be positive".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be positive".to_string()));
        }
        Ok(())
    }
}

fn random_secret(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SECRET_ALPHABET[rng.gen_range(0..SECRET_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub name: String,
    /// Address in CIDR notation
    pub address: String,
    /// Send every frame we originate to this address instead
    pub router: Option<String>,
    pub mtu: usize,
    pub packet_mtu: usize,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "meshvpn0".to_string(),
            address: "10.1.0.1/24".to_string(),
            router: None,
            mtu: 1200,
            packet_mtu: 1420,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub frame_timeout: Duration,
    pub concurrency: usize,
    pub channel_buffer_size: usize,
    pub max_streams: usize,
    /// Open a fresh stream per frame instead of pooling
    pub low_profile: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_secs(15),
            concurrency: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            channel_buffer_size: 0,
            max_streams: 100,
            low_profile: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub announce_interval: Duration,
    pub sync_interval: Duration,
    /// Disk store location, memory store when absent
    pub state_dir: Option<PathBuf>,
    pub cache_capacity_bytes: u64,
    pub block_cache: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(10),
            state_dir: None,
            cache_capacity_bytes: 50 * 1024 * 1024,
            block_cache: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AliveConfig {
    pub announce: Duration,
    pub scrub: Duration,
    /// A node is considered offline once its heartbeat is older than this
    pub max: Duration,
}

impl Default for AliveConfig {
    fn default() -> Self {
        Self {
            announce: Duration::from_secs(120),
            scrub: Duration::from_secs(600),
            max: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DhcpConfig {
    pub enable: bool,
    pub lease_dir: PathBuf,
    /// Delay between leasing attempts
    pub poll_interval: Duration,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            lease_dir: PathBuf::from(".leases"),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrustZoneConfig {
    /// Run the peer guardian
    pub enable: bool,
    pub relaxed: bool,
    pub autoclean: bool,
    /// Drop ledger messages from peers outside the trust zone
    pub gate: bool,
    pub sync_interval: Duration,
    /// Provider name -> provider options
    pub auth_providers: BTreeMap<String, BTreeMap<String, String>>,
    /// Provider key -> public key, written to the ledger by this node
    pub authorized_keys: BTreeMap<String, String>,
}

impl Default for TrustZoneConfig {
    fn default() -> Self {
        Self {
            enable: false,
            relaxed: false,
            autoclean: false,
            gate: false,
            sync_interval: Duration::from_secs(120),
            auth_providers: BTreeMap::new(),
            authorized_keys: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket gossip listener
    pub listen: String,
    /// Peer stream listener, gossip port + 1 when unset
    pub stream_listen: Option<String>,
    /// `host:port` gossip endpoints dialed at startup
    pub bootstrap: Vec<String>,
    /// Skip payload sealing
    pub insecure: bool,
    /// Identity key file, random identity when unset
    pub identity: Option<PathBuf>,
    /// Host other peers should dial us on
    pub advertise_host: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4001".to_string(),
            stream_listen: None,
            bootstrap: Vec::new(),
            insecure: false,
            identity: None,
            advertise_host: None,
        }
    }
}

/// Everything a node needs, validated before it joins the network
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub connection: ConnectionData,
    pub interface: InterfaceConfig,
    pub engine: EngineConfig,
    pub ledger: LedgerConfig,
    pub alive: AliveConfig,
    pub dhcp: DhcpConfig,
    pub trust_zone: TrustZoneConfig,
    /// Peer ids, addresses or CIDRs
    pub blacklist: Vec<String>,
    pub transport: TransportConfig,
    /// Join the generic room next to the ledger room
    pub generic_hub: bool,
    pub hub_rotation_check: Duration,
    pub hub_rotation_grace: Duration,
}

impl NodeConfig {
    pub fn new(connection: ConnectionData) -> Self {
        Self {
            connection,
            interface: InterfaceConfig::default(),
            engine: EngineConfig::default(),
            ledger: LedgerConfig::default(),
            alive: AliveConfig::default(),
            dhcp: DhcpConfig::default(),
            trust_zone: TrustZoneConfig::default(),
            blacklist: Vec::new(),
            transport: TransportConfig::default(),
            generic_hub: true,
            hub_rotation_check: Duration::from_secs(1),
            hub_rotation_grace: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.interface_ip()?;
        if let Some(router) = &self.interface.router {
            router
                .parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidAddress(router.clone()))?;
        }
        if self.interface.mtu == 0 {
            return Err(ConfigError::Invalid("mtu must be positive".to_string()));
        }
        if self.engine.max_streams == 0 {
            return Err(ConfigError::Invalid("max_streams must be positive".to_string()));
        }
        self.blacklist()?;
        if self.trust_zone.enable {
            trustzone::build_providers(&self.trust_zone.auth_providers)?;
        }
        Ok(())
    }

    /// Interface address without the prefix
    pub fn interface_ip(&self) -> Result<Ipv4Addr, ConfigError> {
        let (ip, _) = split_cidr(&self.interface.address)?;
        Ok(ip)
    }

    /// Prefix length of the interface network
    pub fn interface_prefix(&self) -> Result<u8, ConfigError> {
        let (_, prefix) = split_cidr(&self.interface.address)?;
        Ok(prefix)
    }

    /// Deny list for transports and hub messages. The interface subnet is
    /// always on it so the overlay never tunnels through itself.
    pub fn blacklist(&self) -> Result<Blacklist, ConfigError> {
        let mut blacklist =
            Blacklist::parse(&self.blacklist).map_err(|e| ConfigError::Blacklist(e.to_string()))?;
        let (ip, prefix) = split_cidr(&self.interface.address)?;
        blacklist.block_network(Cidr::new(ip.into(), prefix));
        Ok(blacklist)
    }

    pub fn stream_listen(&self) -> Result<String, ConfigError> {
        if let Some(listen) = &self.transport.stream_listen {
            return Ok(listen.clone());
        }
        let (host, port) = self
            .transport
            .listen
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(self.transport.listen.clone()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.transport.listen.clone()))?;
        Ok(format!("{}:{}", host, port.wrapping_add(1)))
    }

    /// Endpoints announced to the peers we connect to
    pub fn advertise(&self) -> Result<PeerAddresses, ConfigError> {
        let Some(host) = &self.transport.advertise_host else {
            return Ok(PeerAddresses::default());
        };
        let port = |addr: &str| {
            addr.rsplit_once(':')
                .map(|(_, port)| port.to_string())
                .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))
        };
        Ok(PeerAddresses {
            gossip: Some(format!("{}:{}", host, port(&self.transport.listen)?)),
            stream: Some(format!("{}:{}", host, port(&self.stream_listen()?)?)),
        })
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            room: self.connection.room_otp(),
            exchange: self.connection.exchange_otp(),
            max_message_size: self.connection.max_message_size,
            generic: self.generic_hub,
            rotation_check: self.hub_rotation_check,
            rotation_grace: self.hub_rotation_grace,
        }
    }
}

fn split_cidr(address: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(address.to_string());
    let (ip, prefix) = match address.split_once('/') {
        Some((ip, prefix)) => (ip, prefix.parse::<u8>().map_err(|_| invalid())?),
        None => (address, 24),
    };
    if prefix > 32 {
        return Err(invalid());
    }
    Ok((ip.parse().map_err(|_| invalid())?, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_token_roundtrip() {
        let data = ConnectionData::generate(DEFAULT_OTP_INTERVAL);
        assert_eq!(data.room.len(), 32);
        assert_eq!(data.max_message_size, 20 << 20);

        let token = data.to_token().unwrap();
        assert_eq!(ConnectionData::from_token(&token).unwrap(), data);
    }

    #[test]
    fn test_yaml_field_names() {
        let data = ConnectionData::generate(60);
        let yaml = data.to_yaml().unwrap();
        assert!(yaml.contains("otp:"));
        assert!(yaml.contains("crypto:"));
        assert!(yaml.contains("max_message_size:"));
        assert!(yaml.contains("room:"));
    }

    #[test]
    fn test_bad_token() {
        assert!(matches!(
            ConnectionData::from_token("not base64!"),
            Err(ConfigError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_missing_network_is_fatal() {
        assert!(matches!(ConnectionData::load(None, None), Err(ConfigError::MissingNetwork)));
        assert!(matches!(ConnectionData::load(Some("  "), None), Err(ConfigError::MissingNetwork)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.yaml");
        let data = ConnectionData::generate(60);
        std::fs::write(&path, data.to_yaml().unwrap()).unwrap();
        assert_eq!(ConnectionData::load(None, Some(&path)).unwrap(), data);
    }

    #[test]
    fn test_validate() {
        let mut config = NodeConfig::new(ConnectionData::generate(60));
        config.validate().unwrap();

        config.interface.address = "10.1.0.300/24".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(_))));

        config.interface.address = "10.1.0.1/24".to_string();
        config.trust_zone.enable = true;
        config
            .trust_zone
            .auth_providers
            .insert("unknown".to_string(), BTreeMap::new());
        assert!(matches!(config.validate(), Err(ConfigError::UnknownAuthProvider(_))));
    }

    #[test]
    fn test_blacklist_includes_interface_subnet() {
        let config = NodeConfig::new(ConnectionData::generate(60));
        let blacklist = config.blacklist().unwrap();
        assert!(blacklist.blocks_addr(&IpAddr::from([10, 1, 0, 77])));
        assert!(!blacklist.blocks_addr(&IpAddr::from([192, 168, 1, 1])));
    }

    #[test]
    fn test_stream_listen_defaults_to_next_port() {
        let config = NodeConfig::new(ConnectionData::generate(60));
        assert_eq!(config.stream_listen().unwrap(), "0.0.0.0:4002");
    }

    #[test]
    fn test_advertise_uses_listen_ports() {
        let mut config = NodeConfig::new(ConnectionData::generate(60));
        assert_eq!(config.advertise().unwrap(), PeerAddresses::default());

        config.transport.advertise_host = Some("192.168.1.5".to_string());
        let addresses = config.advertise().unwrap();
        assert_eq!(addresses.gossip.as_deref(), Some("192.168.1.5:4001"));
        assert_eq!(addresses.stream.as_deref(), Some("192.168.1.5:4002"));
    }
}
