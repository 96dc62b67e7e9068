//! HTTP egress through peers
//!
//! Egress nodes announce themselves in `egress` and open outbound TCP
//! connections for peers listed in `users`. The local HTTP proxy picks a
//! live egress node at random and tunnels each client connection through it:
//! `CONNECT` requests become raw tunnels, plain requests are forwarded in
//! origin form.

use crate::error::NodeError;
use crate::node::{NetworkService, NodeContext};
use crate::protocol::{EGRESS, EGRESS_PROTOCOL};
use crate::services::alive::available_nodes;
use crate::services::{announce_user, is_user, ACCEPTED};
use async_trait::async_trait;
use meshvpn_ledger::{Data, Ledger};
use meshvpn_p2p::{handler, BoxStream, IncomingStream, PeerId, StreamHandler};
use rand::seq::SliceRandom;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_REQUEST_HEAD: usize = 16 * 1024;
const MAX_TARGET_LEN: u16 = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Lets users of the network reach the outside world through this node
pub struct EgressService {
    announce: Duration,
}

impl EgressService {
    pub fn new(announce: Duration) -> Self {
        Self { announce }
    }
}

#[async_trait]
impl NetworkService for EgressService {
    fn name(&self) -> &str {
        "egress"
    }

    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        ctx.streams.set_handler(EGRESS_PROTOCOL, egress_handler(ctx.clone()));
        let _announcer = ctx.ledger.announce_update(
            ctx.cancel.clone(),
            self.announce,
            EGRESS,
            &ctx.peer_id.to_string(),
            Data::string("ok"),
        );
        tracing::info!("Serving as egress node");
        Ok(())
    }
}

fn egress_handler(ctx: NodeContext) -> StreamHandler {
    handler(move |mut incoming: IncomingStream| {
        let ctx = ctx.clone();
        async move {
            let remote = incoming.remote;
            if !is_user(&ctx, &remote) {
                tracing::info!("Refusing egress stream from {}: not a user", remote.short());
                incoming.reset();
                return;
            }

            let target = match read_target(&mut incoming.stream).await {
                Ok(target) => target,
                Err(e) => {
                    tracing::debug!("Bad egress request from {}: {}", remote.short(), e);
                    incoming.reset();
                    return;
                }
            };
            let mut upstream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
                Ok(Ok(upstream)) => upstream,
                Ok(Err(e)) => {
                    tracing::debug!("Egress to {} for {} failed: {}", target, remote.short(), e);
                    incoming.reset();
                    return;
                }
                Err(_) => {
                    tracing::debug!("Egress to {} for {} timed out", target, remote.short());
                    incoming.reset();
                    return;
                }
            };

            if incoming.stream.write_u8(ACCEPTED).await.is_err() {
                return;
            }
            tracing::debug!("Egress for {} to {}", remote.short(), target);
            if let Err(e) = tokio::io::copy_bidirectional(&mut incoming.stream, &mut upstream).await {
                tracing::debug!("Egress stream from {} ended: {}", remote.short(), e);
            }
        }
    })
}

async fn read_target(stream: &mut BoxStream) -> io::Result<String> {
    let len = stream.read_u16().await?;
    if len == 0 || len > MAX_TARGET_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("target length {}", len)));
    }
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_target(stream: &mut BoxStream, target: &str) -> io::Result<()> {
    let len = u16::try_from(target.len())
        .ok()
        .filter(|len| *len <= MAX_TARGET_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target too long"))?;
    stream.write_u16(len).await?;
    stream.write_all(target.as_bytes()).await
}

/// Egress nodes that are alive, sorted
pub fn egress_nodes(ledger: &Ledger, max: Duration) -> Vec<String> {
    let Some(egress) = ledger.bucket(EGRESS) else {
        return Vec::new();
    };
    available_nodes(ledger, max)
        .into_iter()
        .filter(|node| egress.contains_key(node))
        .collect()
}

/// Listen on `listen` as an HTTP proxy that exits through egress nodes
/// seen alive within `max`. Runs until cancelled.
pub async fn serve_proxy(ctx: &NodeContext, listen: &str, max: Duration) -> Result<(), NodeError> {
    let _announcer = announce_user(ctx, ctx.cancel.clone());
    let listener = TcpListener::bind(listen).await?;
    tracing::info!("HTTP proxy listening on {}", listener.local_addr()?);

    loop {
        let (client, addr) = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy_connection(&ctx, client, max).await {
                tracing::debug!("Proxied connection from {} failed: {}", addr, e);
            }
        });
    }
}

async fn proxy_connection(ctx: &NodeContext, mut client: TcpStream, max: Duration) -> Result<(), NodeError> {
    let request = read_request(&mut client).await?;

    let chosen = egress_nodes(&ctx.ledger, max).choose(&mut rand::thread_rng()).cloned();
    let Some(chosen) = chosen else {
        client.write_all(UNAVAILABLE).await?;
        return Err(NodeError::NotFound("live egress node".to_string()));
    };
    let egress: PeerId = chosen.parse()?;

    let mut stream = match open_egress(ctx, &egress, &request.target).await {
        Ok(stream) => stream,
        Err(e) => {
            client.write_all(BAD_GATEWAY).await?;
            return Err(e);
        }
    };
    tracing::debug!("Proxying {} via {}", request.target, egress.short());

    if request.connect {
        client.write_all(ESTABLISHED).await?;
    }
    stream.write_all(&request.forward).await?;
    tokio::io::copy_bidirectional(&mut client, &mut stream).await?;
    Ok(())
}

async fn open_egress(ctx: &NodeContext, egress: &PeerId, target: &str) -> Result<BoxStream, NodeError> {
    let mut stream = ctx.streams.open_stream(egress, EGRESS_PROTOCOL).await?;
    write_target(&mut stream, target).await?;
    match stream.read_u8().await {
        Ok(ACCEPTED) => Ok(stream),
        _ => Err(NodeError::NotFound(format!("route to {} via {}", target, egress.short()))),
    }
}

async fn read_request(client: &mut TcpStream) -> Result<ProxyRequest, NodeError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(NodeError::BadRequest("connection closed before the request head".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(request) = parse_request(&buf)? {
            return Ok(request);
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(NodeError::BadRequest("request head too large".to_string()));
        }
    }
}

/// Where a proxied connection goes and the bytes to send ahead of the rest
/// of the client stream
#[derive(Debug, PartialEq, Eq)]
struct ProxyRequest {
    /// `host:port`
    target: String,
    /// `CONNECT` tunnel rather than a forwarded request
    connect: bool,
    forward: Vec<u8>,
}

/// Parse a proxy request head out of `buf`; `None` while incomplete
fn parse_request(buf: &[u8]) -> Result<Option<ProxyRequest>, NodeError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    let head_len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(NodeError::BadRequest(e.to_string())),
    };
    let method = request.method.unwrap_or_default();
    let uri = request.path.unwrap_or_default();
    let version = request.version.unwrap_or(1);

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Some(ProxyRequest {
            target: with_port(uri, 443),
            connect: true,
            forward: buf[head_len..].to_vec(),
        }));
    }

    let (authority, path) = match uri.strip_prefix("http://") {
        Some(rest) => match rest.find('/') {
            Some(slash) => (rest[..slash].to_string(), rest[slash..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        },
        None => {
            let host = request
                .headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case("host"))
                .and_then(|header| std::str::from_utf8(header.value).ok())
                .ok_or_else(|| NodeError::BadRequest(format!("no host for {}", uri)))?;
            (host.trim().to_string(), uri.to_string())
        }
    };
    if authority.is_empty() {
        return Err(NodeError::BadRequest(format!("no host for {}", uri)));
    }

    // Swap the request line for its origin form, keep the rest verbatim
    let line_end = buf
        .windows(2)
        .position(|pair| pair == b"\r\n")
        .map_or(head_len, |pos| pos + 2);
    let mut forward = format!("{} {} HTTP/1.{}\r\n", method, path, version).into_bytes();
    forward.extend_from_slice(&buf[line_end..]);

    Ok(Some(ProxyRequest {
        target: with_port(&authority, 80),
        connect: false,
        forward,
    }))
}

fn with_port(authority: &str, default: u16) -> String {
    let has_port = !authority.ends_with(']')
        && authority
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if has_port {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let request = parse_request(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(request.connect);
        assert_eq!(request.target, "example.com:8443");
        assert!(request.forward.is_empty());

        let request = parse_request(b"CONNECT example.com HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(request.target, "example.com:443");
    }

    #[test]
    fn test_parse_absolute_request_rewrites_line() {
        let raw = b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\nbody";
        let request = parse_request(raw).unwrap().unwrap();
        assert!(!request.connect);
        assert_eq!(request.target, "example.com:80");
        assert_eq!(
            request.forward,
            b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\nbody".to_vec()
        );

        let request = parse_request(b"GET http://10.0.0.1:8080 HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert_eq!(request.target, "10.0.0.1:8080");
        assert!(request.forward.starts_with(b"GET / HTTP/1.0\r\n"));
    }

    #[test]
    fn test_parse_origin_form_uses_host_header() {
        let request = parse_request(b"GET /x HTTP/1.1\r\nHost: internal:9000\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(request.target, "internal:9000");

        assert!(matches!(
            parse_request(b"GET /x HTTP/1.1\r\n\r\n"),
            Err(NodeError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_partial_and_garbage() {
        assert!(parse_request(b"GET http://example.com/ HTTP/1.1\r\nHost: exa").unwrap().is_none());
        assert!(parse_request(b"\x00\x01\x02\r\n\r\n").is_err());
    }

    #[test]
    fn test_with_port() {
        assert_eq!(with_port("host", 80), "host:80");
        assert_eq!(with_port("host:1", 80), "host:1");
        assert_eq!(with_port("[::1]", 443), "[::1]:443");
        assert_eq!(with_port("[::1]:8443", 443), "[::1]:8443");
    }
}
