//! Server lifecycle, accept loop and dispatch fan-out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use veil_auth::Authenticator;
use veil_config::Config;
use veil_core::defaults::{DISPATCH_CHANNEL_CAPACITY, REWIND_BUFFER_CAPACITY};
use veil_core::io::RewindStream;
use veil_proto::Command;

use crate::api;
use crate::conn::InboundConn;
use crate::error::ServerError;
use crate::handshake::{authenticate, HandshakeError};
use crate::packet::PacketConn;
use crate::recorder::Recorder;
use crate::redirect::{Redirection, Redirector};
use crate::underlay::{BoxStream, InboundStream, Underlay};

/// The trojan tunnel server.
///
/// Built over an [`Underlay`] producing raw byte streams. Every stream runs
/// the authentication handshake on its own task; successes land on one of
/// three bounded queues drained through the `accept_*` methods, failures are
/// replayed to the fallback HTTP backend.
pub struct Server {
    underlay: Arc<dyn Underlay>,
    recorder: Arc<Recorder>,
    cancel: CancellationToken,
    conn_rx: Mutex<mpsc::Receiver<InboundConn>>,
    mux_rx: Mutex<mpsc::Receiver<InboundConn>>,
    packet_rx: Mutex<mpsc::Receiver<PacketConn>>,
}

impl Server {
    /// Build the server and start its accept loop.
    ///
    /// Verifies the fallback backend is reachable (unless disabled) before
    /// announcing ready. The authenticator is an explicit dependency;
    /// callers that run several servers share one by cloning the `Arc`.
    pub async fn new(
        config: &Config,
        underlay: Arc<dyn Underlay>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>, ServerError> {
        let remote = config.server.remote_addr();
        let redirect_addr = lookup_host(remote.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ServerError::Config(format!("cannot resolve redirect address {remote}")))?;

        if !config.server.disable_http_check {
            // Throwaway dial to verify the backend before announcing ready.
            TcpStream::connect(redirect_addr).await.map_err(|err| {
                ServerError::Config(format!(
                    "invalid redirect address, check your http server {redirect_addr}: {err}"
                ))
            })?;
            debug!(target = %redirect_addr, "fallback backend reachable");
        }

        let cancel = CancellationToken::new();
        let recorder = Arc::new(Recorder::new(config.recorder.capacity));
        let (conn_tx, conn_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
        let (mux_tx, mux_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
        let (packet_tx, packet_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);

        if config.api.enabled {
            tokio::spawn(api::serve(
                config.api.listen.clone(),
                auth.clone(),
                recorder.clone(),
                cancel.clone(),
            ));
        }

        let accept = Arc::new(AcceptLoop {
            underlay: underlay.clone(),
            auth,
            redirector: Redirector::new(cancel.clone()),
            redirect_addr,
            recorder: recorder.clone(),
            handshake_timeout: Duration::from_secs(config.server.handshake_timeout_secs),
            conn_tx,
            mux_tx,
            packet_tx,
            cancel: cancel.clone(),
        });
        tokio::spawn(accept.run());

        debug!("trojan server created");
        Ok(Arc::new(Server {
            underlay,
            recorder,
            cancel,
            conn_rx: Mutex::new(conn_rx),
            mux_rx: Mutex::new(mux_rx),
            packet_rx: Mutex::new(packet_rx),
        }))
    }

    /// Next plain stream connection. FIFO within the queue.
    pub async fn accept_stream(&self) -> Result<InboundConn, ServerError> {
        let mut rx = self.conn_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ServerError::Closed),
            conn = rx.recv() => conn.ok_or(ServerError::Closed),
        }
    }

    /// Next mux-bearing connection (MUX command or the sentinel domain).
    pub async fn accept_mux(&self) -> Result<InboundConn, ServerError> {
        let mut rx = self.mux_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ServerError::Closed),
            conn = rx.recv() => conn.ok_or(ServerError::Closed),
        }
    }

    /// Next packet session.
    pub async fn accept_packet(&self) -> Result<PacketConn, ServerError> {
        let mut rx = self.packet_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ServerError::Closed),
            conn = rx.recv() => conn.ok_or(ServerError::Closed),
        }
    }

    /// The connection-event recorder.
    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Cancel the server context and close the underlay. Unblocks every
    /// pending `accept_*` call with [`ServerError::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
        self.underlay.close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct AcceptLoop {
    underlay: Arc<dyn Underlay>,
    auth: Arc<dyn Authenticator>,
    redirector: Redirector,
    redirect_addr: SocketAddr,
    recorder: Arc<Recorder>,
    handshake_timeout: Duration,
    conn_tx: mpsc::Sender<InboundConn>,
    mux_tx: mpsc::Sender<InboundConn>,
    packet_tx: mpsc::Sender<PacketConn>,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(self: Arc<Self>) {
        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.underlay.accept_conn() => match res {
                    Ok(raw) => raw,
                    Err(err) => {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        // Transient accept errors (handshake aborts and the
                        // like) must not stop the loop.
                        warn!(error = %err, "failed to accept conn");
                        continue;
                    }
                },
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.handle(raw).await;
            });
        }
        debug!("accept loop stopped");
    }

    async fn handle(&self, raw: InboundStream) {
        let InboundStream {
            stream,
            peer,
            headers,
        } = raw;
        let mut rewind = RewindStream::new(stream);
        rewind.set_buffer_size(REWIND_BUFFER_CAPACITY);

        let outcome = tokio::time::timeout(
            self.handshake_timeout,
            authenticate(&mut rewind, &*self.auth, peer, headers.as_deref()),
        )
        .await;

        let authed = match outcome {
            Ok(Ok(authed)) => authed,
            Ok(Err(HandshakeError::Reject(reason))) => {
                warn!(peer = %peer, reason = %reason, "connection with invalid trojan header");
                self.redirect(rewind, peer);
                return;
            }
            Ok(Err(HandshakeError::Protocol(err))) => {
                warn!(peer = %peer, error = %err, "malformed request after valid credential");
                return;
            }
            Err(_) => {
                // Still buffering means authentication never completed:
                // treat like any other probe. Past that point the client
                // was valid, just slow; close silently.
                if rewind.is_buffering() {
                    warn!(peer = %peer, "handshake timed out");
                    self.redirect(rewind, peer);
                } else {
                    debug!(peer = %peer, "post-auth handshake timed out");
                }
                return;
            }
        };

        let conn = InboundConn::new(
            rewind,
            authed.user,
            authed.hash,
            authed.envelope,
            peer,
            authed.real_ip,
        );

        match conn.envelope().command {
            Command::Connect if conn.envelope().address.is_mux_sentinel() => {
                debug!(peer = %peer, "mux(r) connection");
                self.dispatch_mux(conn).await;
            }
            Command::Connect => {
                debug!(
                    user = %conn.hash(),
                    peer = %peer,
                    destination = %conn.envelope().address,
                    "trojan connection"
                );
                self.recorder
                    .add(conn.hash(), peer, &conn.envelope().address, "TCP", None);
                if self.conn_tx.send(conn).await.is_err() {
                    debug!(peer = %peer, "stream queue closed, dropping connection");
                }
            }
            Command::Mux => {
                debug!(peer = %peer, "mux connection");
                self.dispatch_mux(conn).await;
            }
            Command::Associate => {
                debug!(peer = %peer, "trojan udp connection");
                if self.packet_tx.send(PacketConn::new(conn)).await.is_err() {
                    debug!(peer = %peer, "packet queue closed, dropping connection");
                }
            }
        }
    }

    async fn dispatch_mux(&self, conn: InboundConn) {
        if self.mux_tx.send(conn).await.is_err() {
            debug!("mux queue closed, dropping connection");
        }
    }

    fn redirect(&self, mut rewind: RewindStream<BoxStream>, peer: SocketAddr) {
        rewind.rewind();
        rewind.stop_buffering();
        self.redirector.redirect(Redirection {
            target: self.redirect_addr,
            stream: Box::new(rewind),
            peer,
        });
    }
}
