//! MeshVPN P2P - Peer identity, gossip rooms and peer streams
//!
//! Architecture:
//! - Peers are identified by their ed25519 public key
//! - Gossip topics carry the sealed ledger and generic rooms
//! - The message hub rotates room topics with a time-windowed secret
//! - Peer streams carry tunnel frames, files and proxied services

pub mod address_book;
pub mod blacklist;
pub mod broadcast;
pub mod error;
pub mod gossip;
pub mod hub;
pub mod identity;
pub mod message;
pub mod otp;
pub mod sealer;
pub mod stream;
pub mod tcp;

pub use address_book::{AddressBook, PeerAddresses};
pub use blacklist::{Blacklist, Cidr};
pub use broadcast::{WsGossip, WsGossipConfig};
pub use error::{P2pError, SealError};
pub use gossip::{GossipTransport, MemoryGossip, MemoryGossipNetwork, Topic};
pub use hub::{Channel, HubConfig, HubReceivers, MessageHub};
pub use identity::{Keypair, PeerId};
pub use message::{Envelope, GossipMessage, HubMessage};
pub use otp::{now_secs, OtpKey};
pub use sealer::{PlainSealer, Sealer, XChaChaSealer};
pub use stream::{handler, BoxStream, IncomingStream, MemoryStreamNetwork, MemoryStreams, PeerStream, StreamHandler, StreamTransport};
pub use tcp::TcpStreams;
