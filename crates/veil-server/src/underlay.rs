//! Underlay abstraction: where raw byte streams come from.
//!
//! The server core treats its transport as an opaque producer of
//! bidirectional byte streams. The production implementation is a TLS
//! listener; tests plug in channel-backed underlays over in-memory pipes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use veil_config::TlsConfig;
use veil_core::defaults::{DEFAULT_CONNECTION_BACKLOG, DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS};

use crate::error::ServerError;
use crate::tls::load_tls_config;

/// A bidirectional byte stream usable by the server core.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

pub type BoxStream = Box<dyn RawStream>;

/// One raw connection produced by an underlay.
pub struct InboundStream {
    pub stream: BoxStream,
    /// TCP peer address.
    pub peer: SocketAddr,
    /// HTTP request headers, present when the underlay carries the stream
    /// over a WebSocket upgrade. Consulted for real-client-IP extraction.
    pub headers: Option<Vec<(String, String)>>,
}

/// Producer of raw byte streams consumed by the accept loop.
#[async_trait]
pub trait Underlay: Send + Sync {
    /// Wait for the next raw stream. Errors are transient while the server
    /// is running; after [`close`](Self::close) every call fails.
    async fn accept_conn(&self) -> io::Result<InboundStream>;

    /// Stop producing streams. Pending and future `accept_conn` calls fail.
    fn close(&self);
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "underlay closed")
}

/// TLS listener underlay: plain TCP accept followed by a rustls handshake.
pub struct TlsUnderlay {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    closed: CancellationToken,
}

impl TlsUnderlay {
    /// Bind a listener and load the certificate chain. The socket is built
    /// through socket2 so the accept backlog can be raised above the libc
    /// default.
    pub async fn bind(listen: SocketAddr, tls: &TlsConfig) -> Result<Self, ServerError> {
        let config = load_tls_config(tls)?;

        let domain = match listen {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&listen.into())?;
        socket.listen(DEFAULT_CONNECTION_BACKLOG as i32)?;

        Ok(Self {
            listener: TcpListener::from_std(socket.into())?,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Underlay for TlsUnderlay {
    async fn accept_conn(&self) -> io::Result<InboundStream> {
        loop {
            let (tcp, peer) = tokio::select! {
                _ = self.closed.cancelled() => return Err(closed_err()),
                res = self.listener.accept() => res?,
            };
            tcp.set_nodelay(true).ok();

            let deadline = Duration::from_secs(DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS);
            match tokio::time::timeout(deadline, self.acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => {
                    debug!(peer = %peer, "TLS handshake completed");
                    return Ok(InboundStream {
                        stream: Box::new(stream),
                        peer,
                        headers: None,
                    });
                }
                Ok(Err(err)) => {
                    warn!(peer = %peer, error = %err, "TLS handshake failed");
                }
                Err(_) => {
                    warn!(peer = %peer, timeout_secs = deadline.as_secs(), "TLS handshake timed out");
                }
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
