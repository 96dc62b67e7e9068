//! Error types for the p2p layer

use crate::identity::PeerId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("peer {peer} does not serve protocol {protocol}")]
    UnsupportedProtocol { peer: PeerId, protocol: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("seal error: {0}")]
    Seal(#[from] SealError),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("topic {0} is closed")]
    TopicClosed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("payload could not be sealed")]
    Seal,

    #[error("payload could not be opened")]
    Open,
}
