//! Outbound stream pool, one framed stream per remote peer

use bytes::Bytes;
use dashmap::DashMap;
use futures::SinkExt;
use meshvpn_p2p::{BoxStream, PeerId};
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

/// Length-delimited frame writer over a peer stream
pub type FrameSink = FramedWrite<BoxStream, LengthDelimitedCodec>;
pub type SharedSink = Arc<Mutex<FrameSink>>;

pub fn frame_sink(stream: BoxStream) -> FrameSink {
    FramedWrite::new(stream, LengthDelimitedCodec::new())
}

/// Bounded map of open streams
pub struct StreamPool {
    streams: DashMap<PeerId, SharedSink>,
    max_streams: usize,
}

impl StreamPool {
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: DashMap::new(),
            max_streams: max_streams.max(1),
        }
    }

    /// Register a fresh stream, evicting an arbitrary one when full
    pub fn connected(&self, peer: PeerId, sink: FrameSink) -> SharedSink {
        if !self.streams.contains_key(&peer) && self.streams.len() >= self.max_streams {
            let victim = self.streams.iter().next().map(|r| *r.key());
            if let Some(victim) = victim {
                tracing::debug!("Stream pool full, evicting {}", victim.short());
                self.streams.remove(&victim);
            }
        }
        let sink = Arc::new(Mutex::new(sink));
        self.streams.insert(peer, sink.clone());
        sink
    }

    pub fn disconnected(&self, peer: &PeerId) {
        self.streams.remove(peer);
    }

    pub fn get(&self, peer: &PeerId) -> Option<SharedSink> {
        self.streams.get(peer).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drop every stream
    pub fn close(&self) {
        self.streams.clear();
    }
}

/// Write one frame through a pooled sink
pub async fn send_frame(sink: &SharedSink, frame: Bytes) -> io::Result<()> {
    sink.lock().await.send(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvpn_p2p::Keypair;

    fn sink() -> FrameSink {
        let (local, _remote) = tokio::io::duplex(64);
        frame_sink(Box::new(local))
    }

    #[tokio::test]
    async fn test_pool_is_bounded() {
        let pool = StreamPool::new(2);
        let peers: Vec<PeerId> = (0..3).map(|_| Keypair::generate().peer_id()).collect();

        for peer in &peers {
            pool.connected(*peer, sink());
        }
        assert_eq!(pool.len(), 2);
        assert!(pool.get(&peers[2]).is_some());

        pool.connected(peers[2], sink());
        assert_eq!(pool.len(), 2);

        pool.disconnected(&peers[2]);
        assert!(pool.get(&peers[2]).is_none());

        pool.close();
        assert!(pool.is_empty());
    }
}
