//! File and service sharing through peer streams

use super::{eventually, TestNetwork, TestNode};
use crate::error::NodeError;
use crate::protocol::{EGRESS, EGRESS_PROTOCOL, FILES, SERVICES, USERS};
use crate::services::{
    connect_service, egress_nodes, receive_file, register_service, serve_proxy, share_file, AliveService, EgressService,
};
use crate::types::{File, Service};
use meshvpn_p2p::{Keypair, StreamTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test(flavor = "multi_thread")]
async fn test_file_transfer() {
    let network = TestNetwork::new();
    let owner = network.spawn(network.config()).await;
    let receiver = network.spawn(network.config()).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source, &content).unwrap();

    let owner_ctx = owner.node.context(network.cancel.clone());
    let _share = share_file(&owner_ctx, "dataset", source).unwrap();

    let dest = dir.path().join("dest.bin");
    let receiver_ctx = receiver.node.context(network.cancel.clone());
    let received = tokio::time::timeout(
        Duration::from_secs(15),
        receive_file(&receiver_ctx, "dataset", dest.clone(), Duration::from_millis(100)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(received, content.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    let file: File = receiver.node.ledger().get_value(FILES, "dataset").unwrap();
    assert_eq!(file.peer_id, owner.node.peer_id().to_string());
    assert!(owner
        .node
        .ledger()
        .get_key(USERS, &receiver.node.peer_id().to_string())
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_share_missing_file_fails() {
    let network = TestNetwork::new();
    let owner = network.spawn(network.config()).await;
    let ctx = owner.node.context(network.cancel.clone());

    let result = share_file(&ctx, "ghost", "/nonexistent/meshvpn/file".into());
    assert!(matches!(result, Err(NodeError::Io(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receive_stops_on_cancel() {
    let network = TestNetwork::new();
    let receiver = network.spawn(network.config()).await;
    let cancel = network.cancel.child_token();
    let ctx = receiver.node.context(cancel.clone());

    let dir = tempfile::tempdir().unwrap();
    let waiting = tokio::spawn(async move {
        receive_file(&ctx, "never", dir.path().join("never"), Duration::from_millis(50)).await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(NodeError::Cancelled)));
}

async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn free_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_proxy() {
    let network = TestNetwork::new();
    let owner = network.spawn(network.config()).await;
    let client = network.spawn(network.config()).await;

    let target = echo_server().await;
    let owner_ctx = owner.node.context(network.cancel.clone());
    let _service = register_service(&owner_ctx, "echo", &target);

    let listen = free_port().await;
    let client_ctx = client.node.context(network.cancel.clone());
    let bind = listen.clone();
    tokio::spawn(async move {
        let _ = connect_service(&client_ctx, "echo", &bind).await;
    });

    let client_ledger = client.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = client_ledger.clone();
            async move { ledger.get_value::<Service>(SERVICES, "echo").is_some() }
        })
        .await
    );

    // Retry until the owner has seen us in `users`
    let echoed = eventually(Duration::from_secs(10), || {
        let listen = listen.clone();
        async move {
            let Ok(mut conn) = TcpStream::connect(&listen).await else {
                return false;
            };
            if conn.write_all(b"ping").await.is_err() {
                return false;
            }
            let mut buf = [0u8; 4];
            matches!(
                tokio::time::timeout(Duration::from_millis(500), conn.read_exact(&mut buf)).await,
                Ok(Ok(_))
            ) && &buf == b"ping"
        }
    })
    .await;
    assert!(echoed);
}

/// Origin server answering every request with its own request line
async fn origin_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if conn.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }
                let line = String::from_utf8_lossy(&head).lines().next().unwrap_or_default().to_string();
                let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", line.len(), line);
                let _ = conn.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

async fn egress_pair(network: &TestNetwork) -> (TestNode, TestNode) {
    let config = network.config();
    let exit = network.node(config.clone());
    exit.add_service(Arc::new(AliveService::new(config.alive.clone())));
    exit.add_service(Arc::new(EgressService::new(Duration::from_millis(100))));
    let exit = network.start(exit).await;

    let client = network.node(config.clone());
    client.add_service(Arc::new(AliveService::new(config.alive.clone())));
    let client = network.start(client).await;
    (exit, client)
}

async fn start_proxy(network: &TestNetwork, client: &TestNode) -> String {
    let listen = free_port().await;
    let ctx = client.node.context(network.cancel.clone());
    let bind = listen.clone();
    tokio::spawn(async move {
        let _ = serve_proxy(&ctx, &bind, Duration::from_secs(60)).await;
    });
    listen
}

/// Send `request` through the proxy until a response shows up
async fn proxied(listen: &str, request: Vec<u8>, expect: &'static [u8]) -> bool {
    eventually(Duration::from_secs(10), || {
        let listen = listen.to_string();
        let request = request.clone();
        async move {
            let Ok(mut conn) = TcpStream::connect(&listen).await else {
                return false;
            };
            if conn.write_all(&request).await.is_err() {
                return false;
            }
            let mut buf = vec![0u8; expect.len()];
            matches!(
                tokio::time::timeout(Duration::from_millis(500), conn.read_exact(&mut buf)).await,
                Ok(Ok(_))
            ) && buf == expect
        }
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_request_through_egress() {
    let network = TestNetwork::new();
    let (exit, client) = egress_pair(&network).await;

    let ledger = client.node.ledger().clone();
    let exit_id = exit.node.peer_id().to_string();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            let exit_id = exit_id.clone();
            async move { egress_nodes(&ledger, Duration::from_secs(60)) == vec![exit_id] }
        })
        .await
    );

    let origin = origin_server().await;
    let listen = start_proxy(&network, &client).await;
    let request = format!("GET http://{}/hello?x=1 HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
    // The origin sees the request line in origin form
    assert!(proxied(&listen, request.into_bytes(), b"HTTP/1.1 200 OK\r\nContent-Length: 23\r\n\r\nGET /hello?x=1 HTTP/1.1").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_tunnel_through_egress() {
    let network = TestNetwork::new();
    let (_exit, client) = egress_pair(&network).await;

    let target = echo_server().await;
    let listen = start_proxy(&network, &client).await;
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).into_bytes();
    request.extend_from_slice(b"ping");
    assert!(proxied(&listen, request, b"HTTP/1.1 200 Connection Established\r\n\r\nping").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxy_without_egress_answers_503() {
    let network = TestNetwork::new();
    let client = network.spawn(network.config()).await;
    let listen = start_proxy(&network, &client).await;

    let mut conn = None;
    for _ in 0..20 {
        if let Ok(stream) = TcpStream::connect(&listen).await {
            conn = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let mut conn = conn.unwrap();
    conn.write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 12];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"HTTP/1.1 503");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_egress_refuses_non_users() {
    let network = TestNetwork::new();
    let (exit, _client) = egress_pair(&network).await;
    let ledger = exit.node.ledger().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.bucket(EGRESS).is_some() }
        })
        .await
    );

    let stranger = network.streams.transport(Keypair::generate().peer_id());
    let mut stream = stranger.open_stream(&exit.node.peer_id(), EGRESS_PROTOCOL).await.unwrap();
    let target = echo_server().await;
    let _ = stream.write_u16(target.len() as u16).await;
    let _ = stream.write_all(target.as_bytes()).await;

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}
