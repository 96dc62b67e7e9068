//! TCP services exposed through the overlay

use crate::error::NodeError;
use crate::node::NodeContext;
use crate::protocol::{SERVICES, SERVICE_PROTOCOL};
use crate::services::{announce_user, is_user};
use crate::types::Service;
use meshvpn_p2p::{handler, IncomingStream, PeerId};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Expose the TCP endpoint `target` to the network as `name`
pub fn register_service(ctx: &NodeContext, name: &str, target: &str) -> JoinHandle<()> {
    tracing::info!("Exposing {} as service {}", target, name);

    let handler_ctx = ctx.clone();
    let target = target.to_string();
    ctx.streams.set_handler(
        SERVICE_PROTOCOL,
        handler(move |mut incoming: IncomingStream| {
            let ctx = handler_ctx.clone();
            let target = target.clone();
            async move {
                let remote = incoming.remote;
                if !is_user(&ctx, &remote) {
                    tracing::info!("Refusing service stream from {}: not a user", remote.short());
                    incoming.reset();
                    return;
                }
                let mut upstream = match TcpStream::connect(&target).await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        tracing::warn!("Could not reach {}: {}", target, e);
                        incoming.reset();
                        return;
                    }
                };
                if let Err(e) = tokio::io::copy_bidirectional(&mut incoming.stream, &mut upstream).await {
                    tracing::debug!("Service stream from {} ended: {}", remote.short(), e);
                }
            }
        }),
    );

    let ledger = ctx.ledger.clone();
    let local = ctx.peer_id.to_string();
    let name = name.to_string();
    ctx.ledger.announce(ctx.cancel.clone(), ctx.config.ledger.announce_interval, move || {
        let current = ledger.get_value::<Service>(SERVICES, &name);
        if current.map_or(true, |service| service.peer_id != local) {
            let service = Service {
                peer_id: local.clone(),
                name: name.clone(),
            };
            if let Err(e) = ledger.add_value(SERVICES, &name, &service) {
                tracing::warn!("Failed to announce service {}: {}", name, e);
            }
        }
        async {}
    })
}

/// Listen on `listen` and tunnel every connection to the owner of `name`.
/// Runs until cancelled.
pub async fn connect_service(ctx: &NodeContext, name: &str, listen: &str) -> Result<(), NodeError> {
    let _announcer = announce_user(ctx, ctx.cancel.clone());
    let listener = TcpListener::bind(listen).await?;
    tracing::info!("Service {} reachable on {}", name, listener.local_addr()?);

    loop {
        let (local, addr) = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let ctx = ctx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = tunnel(&ctx, &name, local).await {
                tracing::warn!("Connection from {} to service {} failed: {}", addr, name, e);
            }
        });
    }
}

async fn tunnel(ctx: &NodeContext, name: &str, mut local: TcpStream) -> Result<(), NodeError> {
    let service = ctx
        .ledger
        .get_value::<Service>(SERVICES, name)
        .ok_or_else(|| NodeError::NotFound(format!("service {}", name)))?;
    let owner: PeerId = service.peer_id.parse()?;

    let mut stream = ctx.streams.open_stream(&owner, SERVICE_PROTOCOL).await?;
    tokio::io::copy_bidirectional(&mut local, &mut stream).await?;
    Ok(())
}
