//! Ledger bucket names and stream protocol tags shared by every peer

/// Routing table: interface address -> `Machine`
pub const MACHINES: &str = "machines";
/// Liveness: peer id -> RFC3339 timestamp
pub const HEALTHCHECK: &str = "healthcheck";
/// Admitted peers: peer id -> ""
pub const TRUSTZONE: &str = "trustzone";
/// Auth provider public keys: provider key -> public key
pub const TRUSTZONE_AUTH: &str = "trustzoneAuth";
/// Address leasing coordination
pub const DHCP: &str = "dhcp";
pub const DHCP_LEADER_KEY: &str = "leader";
/// Exposed services: name -> `Service`
pub const SERVICES: &str = "services";
/// Shared files: name -> `File`
pub const FILES: &str = "files";
/// Peers allowed to consume services and files: peer id -> `User`
pub const USERS: &str = "users";
/// Egress nodes: peer id -> "ok"
pub const EGRESS: &str = "egress";

/// Tunnel frames
pub const VPN_PROTOCOL: &str = "/meshvpn/0.1.0";
pub const FILE_PROTOCOL: &str = "/meshvpn/file/0.1.0";
pub const SERVICE_PROTOCOL: &str = "/meshvpn/service/0.1.0";
pub const EGRESS_PROTOCOL: &str = "/meshvpn/egress/0.1.0";
