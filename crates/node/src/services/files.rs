//! File sharing over peer streams
//!
//! The owner announces the file in `files` and serves it on the file
//! protocol to peers listed in `users`. A served stream starts with one
//! accept byte so receivers can tell a transfer from a refusal.

use crate::error::NodeError;
use crate::node::NodeContext;
use crate::protocol::{FILES, FILE_PROTOCOL};
use crate::services::{announce_user, is_user, ACCEPTED};
use crate::types::File;
use meshvpn_p2p::{handler, IncomingStream, PeerId};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Serve `path` to the network as `name`
pub fn share_file(ctx: &NodeContext, name: &str, path: PathBuf) -> Result<JoinHandle<()>, NodeError> {
    std::fs::metadata(&path)?;
    tracing::info!("Serving {:?} as {}", path, name);

    let handler_ctx = ctx.clone();
    let file_name = name.to_string();
    ctx.streams.set_handler(
        FILE_PROTOCOL,
        handler(move |incoming: IncomingStream| {
            let ctx = handler_ctx.clone();
            let path = path.clone();
            let name = file_name.clone();
            async move {
                let remote = incoming.remote;
                if !is_user(&ctx, &remote) {
                    tracing::info!("Refusing {} to {}: not a user", name, remote.short());
                    incoming.reset();
                    return;
                }
                match serve(incoming, &path).await {
                    Ok(bytes) => tracing::info!("Sent {} ({} bytes) to {}", name, bytes, remote.short()),
                    Err(e) => tracing::warn!("Sending {} to {} failed: {}", name, remote.short(), e),
                }
            }
        }),
    );

    let ledger = ctx.ledger.clone();
    let local = ctx.peer_id.to_string();
    let name = name.to_string();
    Ok(ctx.ledger.announce(ctx.cancel.clone(), ctx.config.ledger.announce_interval, move || {
        let current = ledger.get_value::<File>(FILES, &name);
        if current.map_or(true, |file| file.peer_id != local) {
            let file = File {
                peer_id: local.clone(),
                name: name.clone(),
            };
            if let Err(e) = ledger.add_value(FILES, &name, &file) {
                tracing::warn!("Failed to announce file {}: {}", name, e);
            }
        }
        async {}
    }))
}

async fn serve(mut incoming: IncomingStream, path: &PathBuf) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    incoming.stream.write_u8(ACCEPTED).await?;
    let bytes = tokio::io::copy(&mut file, &mut incoming.stream).await?;
    incoming.stream.shutdown().await?;
    Ok(bytes)
}

/// Wait for `name` to show up in the ledger, then download it to `dest`
pub async fn receive_file(ctx: &NodeContext, name: &str, dest: PathBuf, poll: Duration) -> Result<u64, NodeError> {
    let announcing = ctx.cancel.child_token();
    let _announcer = announce_user(ctx, announcing.clone());
    let result = fetch(ctx, name, &dest, poll).await;
    announcing.cancel();
    result
}

async fn fetch(ctx: &NodeContext, name: &str, dest: &PathBuf, poll: Duration) -> Result<u64, NodeError> {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }

        let Some(file) = ctx.ledger.get_value::<File>(FILES, name) else {
            tracing::debug!("File {} not in the ledger yet", name);
            continue;
        };
        let owner: PeerId = match file.peer_id.parse() {
            Ok(owner) => owner,
            Err(e) => {
                tracing::debug!("File {} has a bad owner: {}", name, e);
                continue;
            }
        };

        let mut stream = match ctx.streams.open_stream(&owner, FILE_PROTOCOL).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("Could not reach {}: {}", owner.short(), e);
                continue;
            }
        };
        if !matches!(stream.read_u8().await, Ok(ACCEPTED)) {
            tracing::debug!("{} refused the transfer, retrying", owner.short());
            continue;
        }

        tracing::info!("Saving {} to {:?}", name, dest);
        let mut out = tokio::fs::File::create(dest).await?;
        let bytes = tokio::io::copy(&mut stream, &mut out).await?;
        out.flush().await?;
        tracing::info!("Received {} ({} bytes)", name, bytes);
        return Ok(bytes);
    }
}
