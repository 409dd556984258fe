//! Integration tests for the server core over an in-memory underlay.
//!
//! These drive the full accept → authenticate → dispatch/redirect pipeline
//! with duplex pipes standing in for TLS streams, and a real TCP listener
//! standing in for the fallback HTTP backend.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use veil_auth::{sha224_hex, Authenticator, MemoryAuthenticator};
use veil_config::{
    ApiConfig, AuthConfig, Config, LoggingConfig, RecorderConfig, ServerConfig, TlsConfig,
};
use veil_proto::{write_request_head, Address, Command, Envelope, Host, MUX_SENTINEL};
use veil_server::{InboundStream, Server, ServerError, Underlay};

const PASSWORD: &str = "test_password_123";

// ============================================================================
// Test Underlay
// ============================================================================

/// Underlay fed by a channel of pre-made streams.
struct TestUnderlay {
    rx: Mutex<mpsc::UnboundedReceiver<InboundStream>>,
    closed: CancellationToken,
}

impl TestUnderlay {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<InboundStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                rx: Mutex::new(rx),
                closed: CancellationToken::new(),
            }),
            tx,
        )
    }
}

#[async_trait]
impl Underlay for TestUnderlay {
    async fn accept_conn(&self) -> io::Result<InboundStream> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "underlay closed"))
            }
            stream = rx.recv() => stream.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "underlay closed")
            }),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Fallback backend: reads from one connection until EOF or `expect` bytes,
/// replies with a fixed body, and reports what it received.
async fn spawn_backend(expect: Option<usize>) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        // First accept is the startup health probe; it sends nothing and
        // closes. Serve connections until one delivers payload bytes.
        loop {
            let (mut conn, _) = listener.accept().await.unwrap();
            let received = match expect {
                Some(n) => {
                    let mut buf = vec![0u8; n];
                    if conn.read_exact(&mut buf).await.is_err() {
                        continue;
                    }
                    buf
                }
                None => {
                    let mut buf = Vec::new();
                    if conn.read_to_end(&mut buf).await.is_err() || buf.is_empty() {
                        continue;
                    }
                    buf
                }
            };
            let _ = conn.write_all(b"HelloWorld").await;
            let _ = tx.send(received);
            return;
        }
    });
    (addr, rx)
}

fn test_config(fallback: SocketAddr, ip_limit: usize) -> Config {
    Config {
        server: ServerConfig {
            listen: "127.0.0.1:0".into(),
            remote_host: fallback.ip().to_string(),
            remote_port: fallback.port(),
            disable_http_check: false,
            handshake_timeout_secs: 5,
        },
        tls: TlsConfig {
            cert: String::new(),
            key: String::new(),
            alpn: Vec::new(),
        },
        auth: AuthConfig {
            passwords: vec![PASSWORD.to_string()],
            ip_limit,
            mysql: Default::default(),
        },
        api: ApiConfig::default(),
        recorder: RecorderConfig { capacity: 16 },
        logging: LoggingConfig::default(),
    }
}

async fn start_server(
    fallback: SocketAddr,
    ip_limit: usize,
) -> (
    Arc<Server>,
    Arc<MemoryAuthenticator>,
    mpsc::UnboundedSender<InboundStream>,
) {
    let config = test_config(fallback, ip_limit);
    let auth = Arc::new(MemoryAuthenticator::from_passwords([PASSWORD], ip_limit));
    let (underlay, tx) = TestUnderlay::new();
    let server = Server::new(&config, underlay, auth.clone()).await.unwrap();
    (server, auth, tx)
}

/// Hand a fresh duplex stream to the underlay, returning the client end.
fn connect(tx: &mpsc::UnboundedSender<InboundStream>, peer: &str) -> DuplexStream {
    let (client, server) = duplex(16 * 1024);
    tx.send(InboundStream {
        stream: Box::new(server),
        peer: peer.parse().unwrap(),
        headers: None,
    })
    .unwrap();
    client
}

fn connect_envelope(host: Host, port: u16) -> Envelope {
    Envelope {
        command: Command::Connect,
        address: Address::new(host, port),
    }
}

async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test timed out")
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn valid_connect_ipv4_dispatches_and_accounts() {
    let (fallback, _) = spawn_backend(None).await;
    let (server, _auth, tx) = start_server(fallback, 0).await;

    let mut client = connect(&tx, "198.51.100.10:41000");
    let envelope = connect_envelope(Host::Ipv4("192.168.1.1".parse().unwrap()), 80);
    write_request_head(&mut client, &sha224_hex(PASSWORD), &envelope)
        .await
        .unwrap();
    let payload = b"GET / HTTP/1.0\r\n\r\n";
    client.write_all(payload).await.unwrap();

    let mut conn = with_timeout(server.accept_stream()).await.unwrap();
    assert_eq!(conn.envelope(), &envelope);
    assert_eq!(conn.peer().to_string(), "198.51.100.10:41000");

    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
    assert_eq!(conn.recv(), payload.len() as u64);

    conn.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
    let mut resp = vec![0u8; 19];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(&resp, b"HTTP/1.0 200 OK\r\n\r\n");
    assert_eq!(conn.sent(), 19);
    assert_eq!(conn.user().recv(), payload.len() as u64);
    assert_eq!(conn.user().sent(), 19);

    let records = server.recorder().snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, "TCP");
    assert_eq!(records[0].destination, "192.168.1.1:80");
    assert_eq!(records[0].hash, sha224_hex(PASSWORD));
}

#[tokio::test]
async fn associate_dispatches_packet_channel() {
    let (fallback, _) = spawn_backend(None).await;
    let (server, _auth, tx) = start_server(fallback, 0).await;

    let mut client = connect(&tx, "198.51.100.11:41001");
    let envelope = Envelope {
        command: Command::Associate,
        address: Address::new(Host::Domain("ex.com".into()), 53),
    };
    write_request_head(&mut client, &sha224_hex(PASSWORD), &envelope)
        .await
        .unwrap();

    // One UDP frame follows the head.
    let dest = Address::new(Host::Domain("ex.com".into()), 53);
    let mut frame = bytes::BytesMut::new();
    veil_proto::write_udp_frame(&mut frame, &dest, b"dns-query").unwrap();
    client.write_all(&frame).await.unwrap();

    let mut session = with_timeout(server.accept_packet()).await.unwrap();
    let (payload, address) = session.recv_from().await.unwrap();
    assert_eq!(payload, b"dns-query");
    assert_eq!(address, dest);
    // The recorder only logs plain stream connections.
    assert!(server.recorder().is_empty());
}

#[tokio::test]
async fn mux_sentinel_routes_to_mux_channel() {
    let (fallback, _) = spawn_backend(None).await;
    let (server, _auth, tx) = start_server(fallback, 0).await;

    let mut client = connect(&tx, "198.51.100.12:41002");
    let envelope = connect_envelope(Host::Domain(MUX_SENTINEL.into()), 443);
    write_request_head(&mut client, &sha224_hex(PASSWORD), &envelope)
        .await
        .unwrap();

    let conn = with_timeout(server.accept_mux()).await.unwrap();
    assert!(conn.envelope().address.is_mux_sentinel());
    // Sentinel connections are not recorded.
    assert!(server.recorder().is_empty());
}

#[tokio::test]
async fn mux_command_routes_to_mux_channel() {
    let (fallback, _) = spawn_backend(None).await;
    let (server, _auth, tx) = start_server(fallback, 0).await;

    let mut client = connect(&tx, "198.51.100.13:41003");
    let envelope = Envelope {
        command: Command::Mux,
        address: Address::new(Host::Domain("mux.internal".into()), 443),
    };
    write_request_head(&mut client, &sha224_hex(PASSWORD), &envelope)
        .await
        .unwrap();

    let conn = with_timeout(server.accept_mux()).await.unwrap();
    assert_eq!(conn.envelope().command, Command::Mux);
}

// ============================================================================
// Probe resistance
// ============================================================================

#[tokio::test]
async fn invalid_hash_redirects_bytes_verbatim() {
    let head_len = 56 + 2 + 8; // fake hash + CRLF + trailing garbage
    let (fallback, received) = spawn_backend(Some(head_len)).await;
    let (server, _auth, tx) = start_server(fallback, 0).await;

    let mut client = connect(&tx, "198.51.100.14:41004");
    let mut probe = Vec::new();
    probe.extend_from_slice(&[b'f'; 56]);
    probe.extend_from_slice(b"\r\nGARBAGE!");
    client.write_all(&probe).await.unwrap();

    let delivered = with_timeout(received).await.unwrap();
    assert_eq!(delivered, probe);

    // The backend's answer reaches the probing client untouched.
    let mut resp = [0u8; 10];
    with_timeout(client.read_exact(&mut resp)).await.unwrap();
    assert_eq!(&resp, b"HelloWorld");
    assert!(server.recorder().is_empty());
}

#[tokio::test]
async fn short_hash_redirects_partial_bytes() {
    let (fallback, received) = spawn_backend(None).await;
    let (server, _auth, tx) = start_server(fallback, 0).await;

    let mut client = connect(&tx, "198.51.100.15:41005");
    client.write_all(&[b'a'; 30]).await.unwrap();
    client.shutdown().await.unwrap();

    let delivered = with_timeout(received).await.unwrap();
    assert_eq!(delivered, vec![b'a'; 30]);
    drop(server);
}

#[tokio::test]
async fn ip_limit_exceeded_redirects_and_leaves_set_intact() {
    let (fallback, received) = spawn_backend(None).await;
    let (server, auth, tx) = start_server(fallback, 1).await;
    let hash = sha224_hex(PASSWORD);

    // First connection claims the user's single IP slot.
    let mut first = connect(&tx, "198.51.100.16:41006");
    let envelope = connect_envelope(Host::Ipv4("10.0.0.1".parse().unwrap()), 80);
    write_request_head(&mut first, &hash, &envelope)
        .await
        .unwrap();
    let conn = with_timeout(server.accept_stream()).await.unwrap();

    let user = auth.auth_user(&hash).await.unwrap();
    assert_eq!(user.active_ip_count(), 1);

    // Second connection from a different address must be redirected.
    let mut second = connect(&tx, "198.51.100.17:41007");
    write_request_head(&mut second, &hash, &envelope)
        .await
        .unwrap();
    second.shutdown().await.unwrap();

    let delivered = with_timeout(received).await.unwrap();
    assert_eq!(&delivered[..56], hash.as_bytes());
    // The active-IP set was not disturbed by the rejected attempt.
    assert_eq!(user.active_ip_count(), 1);

    // Closing the surviving connection releases its slot.
    drop(conn);
    assert_eq!(user.active_ip_count(), 0);
}

#[tokio::test]
async fn malformed_envelope_closes_without_redirect() {
    let (fallback, received) = spawn_backend(None).await;
    let (server, auth, tx) = start_server(fallback, 0).await;
    let hash = sha224_hex(PASSWORD);

    let mut client = connect(&tx, "198.51.100.18:41008");
    client.write_all(hash.as_bytes()).await.unwrap();
    client.write_all(b"\r\n").await.unwrap();
    client.write_all(&[0x55]).await.unwrap(); // unknown command
    client.shutdown().await.unwrap();

    // The connection just closes; the client reads EOF, not backend bytes.
    let mut buf = [0u8; 16];
    let n = with_timeout(client.read(&mut buf)).await.unwrap();
    assert_eq!(n, 0);

    // No IP stays counted for the failed connection.
    let user = auth.auth_user(&hash).await.unwrap();
    assert_eq!(user.active_ip_count(), 0);
    assert!(server.recorder().is_empty());
    drop(received);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn close_unblocks_all_acceptors() {
    let (fallback, _) = spawn_backend(None).await;
    let (server, _auth, _tx) = start_server(fallback, 0).await;

    let s1 = server.clone();
    let stream_task = tokio::spawn(async move { s1.accept_stream().await });
    let s2 = server.clone();
    let mux_task = tokio::spawn(async move { s2.accept_mux().await });
    let s3 = server.clone();
    let packet_task = tokio::spawn(async move { s3.accept_packet().await });

    // Give the acceptors a moment to block.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close();

    assert!(matches!(
        with_timeout(stream_task).await.unwrap(),
        Err(ServerError::Closed)
    ));
    assert!(matches!(
        with_timeout(mux_task).await.unwrap(),
        Err(ServerError::Closed)
    ));
    assert!(matches!(
        with_timeout(packet_task).await.unwrap(),
        Err(ServerError::Closed)
    ));

    // Later calls fail immediately as well.
    assert!(matches!(
        server.accept_stream().await,
        Err(ServerError::Closed)
    ));
}

#[tokio::test]
async fn unreachable_fallback_is_fatal_at_startup() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let config = test_config(dead, 0);
    let auth: Arc<dyn Authenticator> =
        Arc::new(MemoryAuthenticator::from_passwords([PASSWORD], 0));
    let (underlay, _tx) = TestUnderlay::new();
    let result = Server::new(&config, underlay, auth).await;
    assert!(matches!(result, Err(ServerError::Config(_))));
}

#[tokio::test]
async fn disabled_health_check_skips_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let mut config = test_config(dead, 0);
    config.server.disable_http_check = true;
    let auth: Arc<dyn Authenticator> =
        Arc::new(MemoryAuthenticator::from_passwords([PASSWORD], 0));
    let (underlay, _tx) = TestUnderlay::new();
    assert!(Server::new(&config, underlay, auth).await.is_ok());
}
