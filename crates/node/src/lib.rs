//! meshvpn node - overlay VPN on top of the replicated ledger
//!
//! Architecture:
//! - The ledger is replicated over the sealed ledger room of the message hub
//! - The trust zone decides whose ledger messages are ingested
//! - The frame engine routes IP frames with the `machines` bucket
//! - Coordination services keep liveness, leasing and sharing state in
//!   the ledger

pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod protocol;
pub mod services;
pub mod trustzone;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{ConnectionData, NodeConfig};
pub use error::{ConfigError, EngineError, NodeError};
pub use node::{MessageHandler, NetworkService, Node, NodeContext, NodeParts};
