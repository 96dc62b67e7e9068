//! Peer-to-peer byte streams addressed by peer id and protocol tag

use crate::error::P2pError;
use crate::identity::PeerId;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

/// A bidirectional stream to a remote peer
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Abort the stream instead of closing it gracefully
    fn reset(self: Box<Self>) {}
}

impl PeerStream for DuplexStream {}

impl PeerStream for TcpStream {
    fn reset(self: Box<Self>) {
        // Linger of zero turns the close into an RST
        if let Err(e) = socket2::SockRef::from(&*self).set_linger(Some(std::time::Duration::ZERO)) {
            tracing::debug!("Could not reset stream: {}", e);
        }
    }
}

pub type BoxStream = Box<dyn PeerStream>;

/// A stream opened to us by a remote peer
pub struct IncomingStream {
    /// Authenticated identity of the opener
    pub remote: PeerId,
    pub protocol: String,
    pub stream: BoxStream,
}

impl IncomingStream {
    pub fn reset(self) {
        self.stream.reset();
    }
}

/// Callback run for every incoming stream on a protocol
pub type StreamHandler = Arc<dyn Fn(IncomingStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`StreamHandler`]
pub fn handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(IncomingStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |incoming| Box::pin(f(incoming)))
}

/// Opens streams to peers and dispatches streams opened to us
#[async_trait]
pub trait StreamTransport: Send + Sync {
    fn local_id(&self) -> PeerId;

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, P2pError>;

    /// Register the handler for a protocol, replacing any previous one
    fn set_handler(&self, protocol: &str, handler: StreamHandler);

    fn remove_handler(&self, protocol: &str);
}

/// In-process stream fabric for tests and simulations
#[derive(Clone, Default)]
pub struct MemoryStreamNetwork {
    handlers: Arc<DashMap<(PeerId, String), StreamHandler>>,
}

impl MemoryStreamNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, peer: PeerId) -> MemoryStreams {
        MemoryStreams {
            network: self.clone(),
            peer,
        }
    }
}

/// One peer's endpoint on a [`MemoryStreamNetwork`]
#[derive(Clone)]
pub struct MemoryStreams {
    network: MemoryStreamNetwork,
    peer: PeerId,
}

#[async_trait]
impl StreamTransport for MemoryStreams {
    fn local_id(&self) -> PeerId {
        self.peer
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, P2pError> {
        let handler = self
            .network
            .handlers
            .get(&(*peer, protocol.to_string()))
            .map(|r| r.value().clone())
            .ok_or_else(|| P2pError::UnsupportedProtocol {
                peer: *peer,
                protocol: protocol.to_string(),
            })?;

        let (local, remote) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        tokio::spawn(handler(IncomingStream {
            remote: self.peer,
            protocol: protocol.to_string(),
            stream: Box::new(remote),
        }));
        Ok(Box::new(local))
    }

    fn set_handler(&self, protocol: &str, handler: StreamHandler) {
        self.network
            .handlers
            .insert((self.peer, protocol.to_string()), handler);
    }

    fn remove_handler(&self, protocol: &str) {
        self.network.handlers.remove(&(self.peer, protocol.to_string()));
    }
}
