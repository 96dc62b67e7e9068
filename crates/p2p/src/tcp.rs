//! Peer streams over plain TCP
//!
//! Each stream starts with a signed request naming the opener, the target
//! and the protocol. The target answers with its own signature over the
//! request, so both ends know who they are talking to before any payload
//! byte is exchanged. Peer addresses come from the shared address book.

use crate::address_book::AddressBook;
use crate::blacklist::Blacklist;
use crate::error::P2pError;
use crate::identity::{Keypair, PeerId};
use crate::stream::{BoxStream, IncomingStream, StreamHandler, StreamTransport};
use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const MAX_HANDSHAKE_FRAME: u32 = 4096;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
struct StreamRequest {
    initiator: PeerId,
    target: PeerId,
    protocol: String,
    timestamp: i64,
    signature: Vec<u8>,
}

impl StreamRequest {
    fn signed_payload(initiator: &PeerId, target: &PeerId, protocol: &str, timestamp: i64) -> Vec<u8> {
        let mut payload = b"meshvpn-stream".to_vec();
        payload.extend_from_slice(initiator.as_bytes());
        payload.extend_from_slice(target.as_bytes());
        payload.extend_from_slice(protocol.as_bytes());
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload
    }
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
enum StreamResponse {
    /// Target's signature over the request signature
    Accepted { signature: Vec<u8> },
    Rejected { reason: String },
}

struct TcpInner {
    keypair: Keypair,
    local: PeerId,
    handlers: DashMap<String, StreamHandler>,
    address_book: AddressBook,
    blacklist: Blacklist,
    connect_timeout: Duration,
}

/// Stream transport over TCP
#[derive(Clone)]
pub struct TcpStreams {
    inner: Arc<TcpInner>,
}

impl TcpStreams {
    /// Bind `listen` and start accepting streams
    pub async fn start(
        keypair: Keypair,
        listen: &str,
        address_book: AddressBook,
        blacklist: Blacklist,
        cancel: CancellationToken,
    ) -> Result<Self, P2pError> {
        let listener = TcpListener::bind(listen).await?;
        tracing::info!("Peer streams listening on {}", listener.local_addr()?);

        let inner = Arc::new(TcpInner {
            local: keypair.peer_id(),
            keypair,
            handlers: DashMap::new(),
            address_book,
            blacklist,
            connect_timeout: Duration::from_secs(10),
        });

        tokio::spawn(accept_loop(inner.clone(), listener, cancel));
        Ok(Self { inner })
    }
}

#[async_trait]
impl StreamTransport for TcpStreams {
    fn local_id(&self) -> PeerId {
        self.inner.local
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, P2pError> {
        let inner = &self.inner;
        let addr = inner
            .address_book
            .stream_addr(peer)
            .ok_or(P2pError::Unreachable(*peer))?;

        let mut stream = tokio::time::timeout(inner.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| P2pError::Unreachable(*peer))??;
        stream.set_nodelay(true)?;

        let timestamp = chrono::Utc::now().timestamp();
        let signature = inner
            .keypair
            .sign(&StreamRequest::signed_payload(&inner.local, peer, protocol, timestamp));
        let request = StreamRequest {
            initiator: inner.local,
            target: *peer,
            protocol: protocol.to_string(),
            timestamp,
            signature: signature.clone(),
        };
        write_frame(&mut stream, &borsh::to_vec(&request)?).await?;

        let response = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| P2pError::Handshake("timed out".to_string()))??;
        match borsh::from_slice::<StreamResponse>(&response)? {
            StreamResponse::Accepted { signature: answer } => {
                if !peer.verify(&signature, &answer) {
                    return Err(P2pError::Handshake(format!("{} failed to prove identity", peer.short())));
                }
                Ok(Box::new(stream))
            }
            StreamResponse::Rejected { reason } => {
                if reason.contains("protocol") {
                    Err(P2pError::UnsupportedProtocol {
                        peer: *peer,
                        protocol: protocol.to_string(),
                    })
                } else {
                    Err(P2pError::Handshake(reason))
                }
            }
        }
    }

    fn set_handler(&self, protocol: &str, handler: StreamHandler) {
        self.inner.handlers.insert(protocol.to_string(), handler);
    }

    fn remove_handler(&self, protocol: &str) {
        self.inner.handlers.remove(protocol);
    }
}

impl TcpInner {
    /// Run the acceptor side of the handshake
    async fn accept(self: Arc<Self>, mut stream: TcpStream) -> Result<(), P2pError> {
        let request = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| P2pError::Handshake("timed out".to_string()))??;
        let request: StreamRequest = borsh::from_slice(&request)?;

        let rejection = self.check_request(&request);
        let handler = self.handlers.get(&request.protocol).map(|r| r.value().clone());

        let response = match (&rejection, &handler) {
            (Some(reason), _) => StreamResponse::Rejected { reason: reason.clone() },
            (None, None) => StreamResponse::Rejected {
                reason: format!("unsupported protocol {}", request.protocol),
            },
            (None, Some(_)) => StreamResponse::Accepted {
                signature: self.keypair.sign(&request.signature),
            },
        };
        write_frame(&mut stream, &borsh::to_vec(&response)?).await?;

        match (rejection, handler) {
            (None, Some(handler)) => {
                stream.set_nodelay(true)?;
                handler(IncomingStream {
                    remote: request.initiator,
                    protocol: request.protocol,
                    stream: Box::new(stream),
                })
                .await;
                Ok(())
            }
            (Some(reason), _) => Err(P2pError::Handshake(reason)),
            (None, None) => Ok(()),
        }
    }

    fn check_request(&self, request: &StreamRequest) -> Option<String> {
        if request.target != self.local {
            return Some("wrong target".to_string());
        }
        if self.blacklist.blocks_peer(&request.initiator) {
            return Some("blacklisted".to_string());
        }
        if (chrono::Utc::now().timestamp() - request.timestamp).abs() > MAX_CLOCK_SKEW_SECS {
            return Some("stale request".to_string());
        }
        let payload = StreamRequest::signed_payload(
            &request.initiator,
            &request.target,
            &request.protocol,
            request.timestamp,
        );
        if !request.initiator.verify(&payload, &request.signature) {
            return Some("bad signature".to_string());
        }
        None
    }
}

async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                if inner.blacklist.blocks_addr(&peer_addr.ip()) {
                    tracing::debug!("Rejected blacklisted stream from {}", peer_addr);
                    continue;
                }
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.accept(stream).await {
                        tracing::debug!("Inbound stream from {} failed: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {}", e);
            }
        }
    }
}

async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> Result<(), P2pError> {
    let len = u32::try_from(data.len()).map_err(|_| P2pError::Handshake("frame too large".to_string()))?;
    stream.write_u32(len).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, P2pError> {
    let len = stream.read_u32().await?;
    if len > MAX_HANDSHAKE_FRAME {
        return Err(P2pError::Handshake(format!("handshake frame of {} bytes", len)));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::PeerAddresses;
    use crate::stream::handler;

    async fn start(book: &AddressBook, cancel: &CancellationToken) -> TcpStreams {
        let keypair = Keypair::generate();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        book.insert(
            keypair.peer_id(),
            PeerAddresses {
                gossip: None,
                stream: Some(addr.clone()),
            },
        );
        TcpStreams::start(keypair, &addr, book.clone(), Blacklist::new(), cancel.clone())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tcp_stream_roundtrip() {
        let cancel = CancellationToken::new();
        let book = AddressBook::new();
        let a = start(&book, &cancel).await;
        let b = start(&book, &cancel).await;
        let a_id = a.local_id();

        b.set_handler(
            "/echo",
            handler(move |mut incoming: IncomingStream| async move {
                assert_eq!(incoming.remote, a_id);
                let mut buf = [0u8; 5];
                if incoming.stream.read_exact(&mut buf).await.is_ok() {
                    let _ = incoming.stream.write_all(&buf).await;
                }
            }),
        );

        let mut stream = a.open_stream(&b.local_id(), "/echo").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tcp_unknown_protocol_and_peer() {
        let cancel = CancellationToken::new();
        let book = AddressBook::new();
        let a = start(&book, &cancel).await;
        let b = start(&book, &cancel).await;

        let err = a.open_stream(&b.local_id(), "/missing").await.err().unwrap();
        assert!(matches!(err, P2pError::UnsupportedProtocol { .. }));

        let stranger = Keypair::generate().peer_id();
        let err = a.open_stream(&stranger, "/missing").await.err().unwrap();
        assert!(matches!(err, P2pError::Unreachable(_)));

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tcp_reset_closes_stream() {
        let cancel = CancellationToken::new();
        let book = AddressBook::new();
        let a = start(&book, &cancel).await;
        let b = start(&book, &cancel).await;

        b.set_handler("/reject", handler(|incoming: IncomingStream| async move { incoming.reset() }));

        let mut stream = a.open_stream(&b.local_id(), "/reject").await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        cancel.cancel();
    }
}
