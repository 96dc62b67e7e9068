//! Error types for the node

use meshvpn_ledger::LedgerError;
use meshvpn_p2p::P2pError;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration, always fatal
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("a network token or a network config file is required")]
    MissingNetwork,

    #[error("invalid network token: {0}")]
    InvalidToken(String),

    #[error("invalid interface address {0}")]
    InvalidAddress(String),

    #[error("unknown auth provider {0}")]
    UnknownAuthProvider(String),

    #[error("auth provider {provider} requires option {option}")]
    MissingProviderOption { provider: String, option: String },

    #[error("invalid blacklist: {0}")]
    Blacklist(String),

    #[error("{0}")]
    Invalid(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-frame failures, logged and dropped
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} not found in the routing table")]
    NoRoute(String),

    #[error("could not parse frame: {0}")]
    Parse(String),

    #[error("stream error: {0}")]
    Stream(#[from] P2pError),

    #[error("frame not delivered within {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("bad proxy request: {0}")]
    BadRequest(String),

    #[error("cancelled")]
    Cancelled,

    #[error("node already started")]
    AlreadyStarted,
}
