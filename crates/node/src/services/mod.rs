//! Coordination and sharing services built on the ledger

pub mod alive;
pub mod dhcp;
pub mod egress;
pub mod files;
pub mod leader;
pub mod proxy;

pub use alive::{available_nodes, AliveService};
pub use dhcp::{read_lease, LeaseService};
pub use egress::{egress_nodes, serve_proxy, EgressService};
pub use files::{receive_file, share_file};
pub use leader::{leader, next_ip};
pub use proxy::{connect_service, register_service};

use crate::node::NodeContext;
use crate::protocol::USERS;
use crate::types::User;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// First byte on a served stream, sent once the owner accepted the request
pub(crate) const ACCEPTED: u8 = 1;

/// Keep this peer in `users` so service and file owners accept its streams
pub(crate) fn announce_user(ctx: &NodeContext, cancel: CancellationToken) -> JoinHandle<()> {
    let ledger = ctx.ledger.clone();
    let local = ctx.peer_id.to_string();
    ctx.ledger.announce(cancel, ctx.config.ledger.announce_interval, move || {
        if ledger.get_key(USERS, &local).is_none() {
            let user = User {
                peer_id: local.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            };
            if let Err(e) = ledger.add_value(USERS, &local, &user) {
                tracing::warn!("Failed to announce user: {}", e);
            }
        }
        async {}
    })
}

/// Whether `peer` announced itself in `users`
pub(crate) fn is_user(ctx: &NodeContext, peer: &meshvpn_p2p::PeerId) -> bool {
    ctx.ledger.get_key(USERS, &peer.to_string()).is_some()
}
