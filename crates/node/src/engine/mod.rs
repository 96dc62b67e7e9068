//! Frame forwarding engine
//!
//! Outbound: frames read from the device are queued to a pool of workers.
//! Each worker looks the destination up in the `machines` routing table and
//! writes the frame to a stream opened to the owning peer. Inbound: streams
//! on the VPN protocol from peers present in the routing table are copied
//! back to the device.

pub mod device;
pub mod frame;
pub mod pool;

pub use device::{Device, MemoryDevice, MemoryDeviceHandle, TunDevice};
pub use frame::Ipv4Header;
pub use pool::StreamPool;

use crate::config::{EngineConfig, InterfaceConfig};
use crate::error::{EngineError, NodeError};
use crate::node::{NetworkService, NodeContext};
use crate::protocol::{MACHINES, VPN_PROTOCOL};
use crate::types::Machine;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use meshvpn_p2p::{handler, IncomingStream, PeerId};
use parking_lot::Mutex;
use pool::{frame_sink, send_frame};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

/// Where the engine gets its own address from
pub enum AddressSource {
    Static(Ipv4Addr),
    /// Wait for the address leasing service
    Lease(oneshot::Receiver<String>),
}

/// Turns an address into a device once it is known
pub type DeviceFactory = Box<dyn FnOnce(Ipv4Addr) -> io::Result<Arc<dyn Device>> + Send>;

pub struct Engine {
    interface: InterfaceConfig,
    config: EngineConfig,
    address: Mutex<Option<AddressSource>>,
    device: Mutex<Option<DeviceFactory>>,
}

impl Engine {
    pub fn new(interface: InterfaceConfig, config: EngineConfig, address: AddressSource, device: DeviceFactory) -> Self {
        Self {
            interface,
            config,
            address: Mutex::new(Some(address)),
            device: Mutex::new(Some(device)),
        }
    }

    /// Engine on an already created device
    pub fn with_device(interface: InterfaceConfig, config: EngineConfig, address: AddressSource, device: Arc<dyn Device>) -> Self {
        Self::new(interface, config, address, Box::new(move |_| Ok(device)))
    }

    async fn resolve_address(&self, ctx: &NodeContext) -> Result<Ipv4Addr, NodeError> {
        let source = self.address.lock().take().ok_or(NodeError::AlreadyStarted)?;
        match source {
            AddressSource::Static(ip) => Ok(ip),
            AddressSource::Lease(rx) => {
                tracing::info!("Waiting for an address lease");
                let lease = tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
                    lease = rx => lease.map_err(|_| NodeError::NotFound("address lease".to_string()))?,
                };
                lease
                    .parse()
                    .map_err(|_| NodeError::NotFound(format!("valid lease (got {})", lease)))
            }
        }
    }
}

#[async_trait]
impl NetworkService for Engine {
    fn name(&self) -> &str {
        "engine"
    }

    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        let address = self.resolve_address(&ctx).await?;
        let factory = self.device.lock().take().ok_or(NodeError::AlreadyStarted)?;
        let device = factory(address)?;

        let router = match &self.interface.router {
            Some(router) => Some(router.parse::<Ipv4Addr>().map_err(|_| {
                NodeError::Config(crate::error::ConfigError::InvalidAddress(router.clone()))
            })?),
            None => None,
        };
        let pool = (!self.config.low_profile).then(|| Arc::new(StreamPool::new(self.config.max_streams)));

        ctx.streams.set_handler(VPN_PROTOCOL, inbound_handler(ctx.clone(), device.clone()));
        let _announcer = announce_machine(&ctx, address);

        let forwarder = Arc::new(Forwarder {
            ctx: ctx.clone(),
            config: self.config.clone(),
            address,
            router,
            pool: pool.clone(),
        });
        read_frames(forwarder, device, self.interface.mtu.max(self.interface.packet_mtu)).await;

        ctx.streams.remove_handler(VPN_PROTOCOL);
        if let Some(pool) = pool {
            pool.close();
        }
        Ok(())
    }
}

/// Keep `machines[address]` pointing at us
fn announce_machine(ctx: &NodeContext, address: Ipv4Addr) -> tokio::task::JoinHandle<()> {
    let ledger = ctx.ledger.clone();
    let local = ctx.peer_id.to_string();
    let address = address.to_string();
    ctx.ledger.announce(ctx.cancel.clone(), ctx.config.ledger.announce_interval, move || {
        let current = ledger.get_value::<Machine>(MACHINES, &address);
        if current.map_or(true, |machine| machine.peer_id != local) {
            let machine = Machine::local(local.clone(), address.clone());
            if let Err(e) = ledger.add_value(MACHINES, &address, &machine) {
                tracing::warn!("Failed to announce machine {}: {}", address, e);
            }
        }
        async {}
    })
}

fn inbound_handler(ctx: NodeContext, device: Arc<dyn Device>) -> meshvpn_p2p::StreamHandler {
    handler(move |incoming: IncomingStream| {
        let ctx = ctx.clone();
        let device = device.clone();
        async move {
            let remote = incoming.remote.to_string();
            let known = ctx.ledger.exists(MACHINES, |value| {
                value
                    .decode::<Machine>()
                    .map(|machine| machine.peer_id == remote)
                    .unwrap_or(false)
            });
            if !known {
                tracing::debug!("Resetting stream from unknown peer {}", incoming.remote.short());
                incoming.reset();
                return;
            }

            let mut frames = FramedRead::new(incoming.stream, LengthDelimitedCodec::new());
            while let Some(frame) = frames.next().await {
                let result = match frame {
                    Ok(frame) => device.send(&frame).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::debug!("Inbound stream from {} ended: {}", remote, e);
                    break;
                }
            }
        }
    })
}

struct Forwarder {
    ctx: NodeContext,
    config: EngineConfig,
    address: Ipv4Addr,
    router: Option<Ipv4Addr>,
    pool: Option<Arc<StreamPool>>,
}

impl Forwarder {
    async fn handle(&self, frame: Bytes) -> Result<(), EngineError> {
        let timeout = self.config.frame_timeout;
        tokio::time::timeout(timeout, self.forward(frame))
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    async fn forward(&self, frame: Bytes) -> Result<(), EngineError> {
        let header = Ipv4Header::parse(&frame)?;
        let dst = match self.router {
            Some(router) if header.src == self.address => router,
            _ => header.dst,
        }
        .to_string();

        let machine = self
            .ctx
            .ledger
            .get_value::<Machine>(MACHINES, &dst)
            .ok_or(EngineError::NoRoute(dst))?;
        let peer: PeerId = machine.peer_id.parse()?;

        if let Some(pool) = &self.pool {
            if let Some(sink) = pool.get(&peer) {
                if send_frame(&sink, frame.clone()).await.is_ok() {
                    return Ok(());
                }
                pool.disconnected(&peer);
            }
        }

        let stream = self.ctx.streams.open_stream(&peer, VPN_PROTOCOL).await?;
        let mut sink = frame_sink(stream);
        match &self.pool {
            Some(pool) => {
                let sink = pool.connected(peer, sink);
                send_frame(&sink, frame).await?;
            }
            None => {
                SinkExt::<Bytes>::send(&mut sink, frame).await?;
                SinkExt::<Bytes>::close(&mut sink).await?;
            }
        }
        Ok(())
    }
}

/// Consecutive device read failures after which the engine stops
pub(crate) const MAX_READ_FAILURES: u32 = 10;
const READ_RETRY_BASE: Duration = Duration::from_millis(10);
const READ_RETRY_MAX: Duration = Duration::from_millis(500);

/// Read frames until cancelled, fanning them out to the workers
async fn read_frames(forwarder: Arc<Forwarder>, device: Arc<dyn Device>, mtu: usize) {
    let cancel = forwarder.ctx.cancel.clone();
    let (tx, rx) = mpsc::channel::<Bytes>(forwarder.config.channel_buffer_size.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let workers: Vec<_> = (0..forwarder.config.concurrency.max(1))
        .map(|_| {
            let forwarder = forwarder.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let frame = rx.lock().await.recv().await;
                    let Some(frame) = frame else { break };
                    if let Err(e) = forwarder.handle(frame).await {
                        tracing::debug!("Could not handle frame: {}", e);
                    }
                }
            })
        })
        .collect();

    let mut buf = vec![0u8; mtu.max(1)];
    let mut failures = 0u32;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = device.recv(&mut buf) => read,
        };
        if read.is_ok() {
            failures = 0;
        }
        match read {
            Ok(0) => continue,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe) => {
                tracing::warn!("Device closed: {}", e);
                break;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_READ_FAILURES {
                    tracing::error!("Giving up on the device after {} read errors: {}", failures, e);
                    break;
                }
                let backoff = READ_RETRY_BASE
                    .saturating_mul(1 << failures.min(16))
                    .min(READ_RETRY_MAX);
                tracing::warn!("Could not read frame, retrying in {:?}: {}", backoff, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    drop(tx);
    for worker in workers {
        let _ = worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_address_source() {
        let engine = Engine::with_device(
            InterfaceConfig::default(),
            EngineConfig::default(),
            AddressSource::Static(Ipv4Addr::new(10, 1, 0, 1)),
            Arc::new(MemoryDevice::new(1).0),
        );
        assert!(engine.address.lock().is_some());
        assert!(engine.device.lock().is_some());
    }
}
