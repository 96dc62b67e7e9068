//! WebSocket flood gossip
//!
//! Every peer keeps WebSocket connections to the peers it dialed and the
//! peers that dialed it. A published message is sent over every connection
//! and each receiver forwards it once, so topic members reach each other
//! across several hops. Duplicates are dropped by message id, and every
//! message carries the origin's signature so provenance survives forwarding.

use crate::address_book::{AddressBook, PeerAddresses};
use crate::blacklist::Blacklist;
use crate::error::P2pError;
use crate::gossip::{GossipTransport, Topic, TOPIC_BUFFER};
use crate::identity::{Keypair, PeerId};
use crate::message::{GossipMessage, WireFrame};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CLOCK_SKEW_SECS: i64 = 300;
const OUTBOUND_BUFFER: usize = 1024;

/// WebSocket gossip settings
#[derive(Debug, Clone)]
pub struct WsGossipConfig {
    /// Bind address for incoming connections
    pub listen: Option<String>,
    /// Addresses we tell other peers to dial
    pub advertise: PeerAddresses,
    /// `host:port` of peers to connect to at startup
    pub bootstrap: Vec<String>,
    /// How often unconnected peers are dialed again
    pub redial_interval: Duration,
    /// Message ids remembered for duplicate suppression
    pub seen_cache: usize,
}

impl Default for WsGossipConfig {
    fn default() -> Self {
        Self {
            listen: Some("0.0.0.0:4001".to_string()),
            advertise: PeerAddresses::default(),
            bootstrap: Vec::new(),
            redial_interval: Duration::from_secs(15),
            seen_cache: 8192,
        }
    }
}

#[derive(Debug)]
struct Connection {
    tx: mpsc::Sender<Vec<u8>>,
    topics: HashSet<String>,
    /// Address we dialed, for outbound connections
    dialed: Option<String>,
}

struct Inner {
    keypair: Keypair,
    local: PeerId,
    config: WsGossipConfig,
    connections: RwLock<HashMap<PeerId, Connection>>,
    subscriptions: DashMap<String, Weak<WsTopic>>,
    seen: Mutex<LruCache<[u8; 32], ()>>,
    nonce: AtomicU64,
    dialing: Mutex<HashSet<String>>,
    address_book: AddressBook,
    blacklist: Blacklist,
}

/// Gossip transport over WebSocket connections
#[derive(Clone)]
pub struct WsGossip {
    inner: Arc<Inner>,
}

impl WsGossip {
    /// Bind the listener (if any) and start dialing bootstrap peers
    pub async fn start(
        keypair: Keypair,
        config: WsGossipConfig,
        address_book: AddressBook,
        blacklist: Blacklist,
        cancel: CancellationToken,
    ) -> Result<Self, P2pError> {
        let listener = match &config.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                tracing::info!("Gossip listening on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        let capacity = NonZeroUsize::new(config.seen_cache).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(Inner {
            local: keypair.peer_id(),
            keypair,
            config,
            connections: RwLock::new(HashMap::new()),
            subscriptions: DashMap::new(),
            seen: Mutex::new(LruCache::new(capacity)),
            nonce: AtomicU64::new(rand::random::<u64>() >> 1),
            dialing: Mutex::new(HashSet::new()),
            address_book,
            blacklist,
        });

        if let Some(listener) = listener {
            tokio::spawn(accept_loop(inner.clone(), listener, cancel.clone()));
        }
        tokio::spawn(dial_loop(inner.clone(), cancel));

        Ok(Self { inner })
    }

    /// Peers with an open connection
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.connections.read().keys().copied().collect()
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.inner.address_book
    }
}

#[async_trait]
impl GossipTransport for WsGossip {
    fn local_id(&self) -> PeerId {
        self.inner.local
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, P2pError> {
        if let Some(existing) = self.inner.subscriptions.get(topic).and_then(|w| w.upgrade()) {
            return Ok(existing);
        }

        let (tx, _) = broadcast::channel(TOPIC_BUFFER);
        let handle = Arc::new(WsTopic {
            name: topic.to_string(),
            tx,
            inner: self.inner.clone(),
        });
        self.inner
            .subscriptions
            .insert(topic.to_string(), Arc::downgrade(&handle));
        self.inner.announce_topics();
        tracing::debug!("Joined gossip topic {}", topic);
        Ok(handle)
    }
}

struct WsTopic {
    name: String,
    tx: broadcast::Sender<GossipMessage>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Topic for WsTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), P2pError> {
        let inner = &self.inner;
        let nonce = inner.nonce.fetch_add(1, Ordering::Relaxed);
        let id = WireFrame::message_id(&self.name, &inner.local, nonce, &data);
        inner.mark_seen(id);

        let frame = WireFrame::Publish {
            topic: self.name.clone(),
            origin: inner.local,
            nonce,
            signature: inner.keypair.sign(&id),
            data,
        };
        inner.send_all(&frame.to_bytes(), &[]);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GossipMessage> {
        self.tx.subscribe()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.inner
            .connections
            .read()
            .iter()
            .filter(|(_, c)| c.topics.contains(&self.name))
            .map(|(p, _)| *p)
            .collect()
    }
}

impl Drop for WsTopic {
    fn drop(&mut self) {
        self.inner
            .subscriptions
            .remove_if(&self.name, |_, weak| weak.strong_count() == 0);
        self.inner.announce_topics();
    }
}

impl Inner {
    fn hello(&self) -> WireFrame {
        let timestamp = chrono::Utc::now().timestamp();
        let addresses = self.config.advertise.clone();
        let signature = self
            .keypair
            .sign(&WireFrame::hello_payload(&self.local, &addresses, timestamp));
        WireFrame::Hello {
            peer: self.local,
            addresses,
            timestamp,
            signature,
        }
    }

    fn topics(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|r| r.value().strong_count() > 0)
            .map(|r| r.key().clone())
            .collect()
    }

    fn announce_topics(&self) {
        let frame = WireFrame::Topics { topics: self.topics() };
        self.send_all(&frame.to_bytes(), &[]);
    }

    /// Returns false if the id was already seen
    fn mark_seen(&self, id: [u8; 32]) -> bool {
        self.seen.lock().put(id, ()).is_none()
    }

    fn send_all(&self, data: &[u8], except: &[PeerId]) {
        for (peer, conn) in self.connections.read().iter() {
            if except.contains(peer) {
                continue;
            }
            if conn.tx.try_send(data.to_vec()).is_err() {
                tracing::warn!("Dropping gossip frame for slow peer {}", peer.short());
            }
        }
    }

    fn handle_frame(&self, from: PeerId, data: &[u8]) {
        let frame = match WireFrame::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Undecodable gossip frame from {}: {}", from.short(), e);
                return;
            }
        };

        match frame {
            WireFrame::Publish {
                topic,
                origin,
                nonce,
                data: payload,
                signature,
            } => {
                let id = WireFrame::message_id(&topic, &origin, nonce, &payload);
                if origin == self.local || self.blacklist.blocks_peer(&origin) {
                    return;
                }
                if !origin.verify(&id, &signature) {
                    tracing::debug!("Bad signature on gossip from {} via {}", origin.short(), from.short());
                    return;
                }
                if !self.mark_seen(id) {
                    return;
                }

                if let Some(sub) = self.subscriptions.get(&topic).and_then(|w| w.upgrade()) {
                    let _ = sub.tx.send(GossipMessage {
                        from: origin,
                        data: Arc::new(payload),
                    });
                }

                self.send_all(data, &[from, origin]);
            }
            WireFrame::Topics { topics } => {
                if let Some(conn) = self.connections.write().get_mut(&from) {
                    conn.topics = topics.into_iter().collect();
                }
            }
            WireFrame::Peers { peers } => {
                for (peer, addresses) in peers {
                    if peer != self.local && !self.blacklist.blocks_peer(&peer) {
                        self.address_book.insert(peer, addresses);
                    }
                }
            }
            WireFrame::Hello { .. } => {}
        }
    }

    /// Drive one connection from handshake to close
    async fn run_connection<S>(self: Arc<Self>, ws: WebSocketStream<S>, dialed: Option<String>) -> Result<(), P2pError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        ws_sender.send(Message::Binary(self.hello().to_bytes())).await?;

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(msg) = ws_receiver.next().await {
                if let Message::Binary(data) = msg? {
                    return Ok(data);
                }
            }
            Err(P2pError::Handshake("connection closed".to_string()))
        })
        .await
        .map_err(|_| P2pError::Handshake("timed out".to_string()))??;

        let peer = self.verify_hello(&first)?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);
        {
            let mut connections = self.connections.write();
            if connections.contains_key(&peer) {
                tracing::debug!("Already connected to {}", peer.short());
                return Ok(());
            }
            connections.insert(
                peer,
                Connection {
                    tx: tx.clone(),
                    topics: HashSet::new(),
                    dialed,
                },
            );
        }
        tracing::info!("Gossip peer {} connected", peer.short());

        let _ = tx.try_send(WireFrame::Topics { topics: self.topics() }.to_bytes());
        let _ = tx.try_send(WireFrame::Peers { peers: self.address_book.all() }.to_bytes());
        drop(tx);

        // Spawn task to forward outbound frames to this peer
        let send_task = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if ws_sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => self.handle_frame(peer, &data),
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!("Gossip connection to {} failed: {}", peer.short(), e);
                    break;
                }
                _ => {}
            }
        }

        send_task.abort();
        self.connections.write().remove(&peer);
        tracing::info!("Gossip peer {} disconnected", peer.short());
        Ok(())
    }

    fn verify_hello(&self, data: &[u8]) -> Result<PeerId, P2pError> {
        let WireFrame::Hello {
            peer,
            addresses,
            timestamp,
            signature,
        } = WireFrame::from_bytes(data).map_err(|e| P2pError::Handshake(e.to_string()))?
        else {
            return Err(P2pError::Handshake("expected hello".to_string()));
        };

        if peer == self.local {
            return Err(P2pError::Handshake("connected to self".to_string()));
        }
        if self.blacklist.blocks_peer(&peer) {
            return Err(P2pError::Handshake(format!("{} is blacklisted", peer.short())));
        }
        if (chrono::Utc::now().timestamp() - timestamp).abs() > MAX_CLOCK_SKEW_SECS {
            return Err(P2pError::Handshake("stale hello".to_string()));
        }
        if !peer.verify(&WireFrame::hello_payload(&peer, &addresses, timestamp), &signature) {
            return Err(P2pError::Handshake("bad hello signature".to_string()));
        }

        self.address_book.insert(peer, addresses);
        Ok(peer)
    }

    /// Addresses worth dialing right now
    fn dial_targets(&self) -> Vec<String> {
        let connections = self.connections.read();
        let dialed: HashSet<&String> = connections.values().filter_map(|c| c.dialed.as_ref()).collect();

        let mut targets: Vec<String> = self
            .config
            .bootstrap
            .iter()
            .filter(|addr| !dialed.contains(addr))
            .cloned()
            .collect();

        // Only the lower id dials discovered peers, so two peers never race
        // to open a connection to each other
        for (peer, addresses) in self.address_book.all() {
            if peer <= self.local || connections.contains_key(&peer) {
                continue;
            }
            if let Some(addr) = addresses.gossip {
                if !targets.contains(&addr) && !dialed.contains(&addr) {
                    targets.push(addr);
                }
            }
        }
        targets
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                if inner.blacklist.blocks_addr(&peer_addr.ip()) {
                    tracing::debug!("Rejected blacklisted gossip connection from {}", peer_addr);
                    continue;
                }
                let inner = inner.clone();
                tokio::spawn(async move {
                    let result = match accept_async(stream).await {
                        Ok(ws) => inner.run_connection(ws, None).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = result {
                        tracing::debug!("Inbound gossip connection from {} failed: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {}", e);
            }
        }
    }
}

async fn dial_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.redial_interval.max(Duration::from_millis(10)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for addr in inner.dial_targets() {
            if !inner.dialing.lock().insert(addr.clone()) {
                continue;
            }
            let inner = inner.clone();
            tokio::spawn(async move {
                let url = format!("ws://{}", addr);
                let result = match connect_async(&url).await {
                    Ok((ws, _)) => {
                        let conn = inner.clone().run_connection(ws, Some(addr.clone()));
                        // Dialing ends once the handshake settles; the
                        // connection itself keeps running
                        inner.dialing.lock().remove(&addr);
                        conn.await
                    }
                    Err(e) => {
                        inner.dialing.lock().remove(&addr);
                        Err(e.into())
                    }
                };
                if let Err(e) = result {
                    tracing::debug!("Gossip dial to {} failed: {}", addr, e);
                }
            });
        }
    }
}
