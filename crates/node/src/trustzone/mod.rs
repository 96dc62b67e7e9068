//! Trust zone: who may write to our ledger
//!
//! The gater filters ledger room messages by sender. The guardian grows the
//! trust set: peers prove possession of an authorized key on the generic
//! room, and whoever verifies the proof records them in the `trustzone`
//! bucket.

pub mod ed25519;
pub mod gater;
pub mod guardian;

pub use ed25519::Ed25519Provider;
pub use gater::{GateMode, PeerGater};
pub use guardian::{build_providers, AuthProvider, PeerGuardian};
