//! Authenticated inbound connection with per-user traffic accounting.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use veil_auth::User;
use veil_core::fmt_bytes;
use veil_core::io::RewindStream;
use veil_proto::Envelope;

use crate::underlay::BoxStream;

/// A single authenticated client stream.
///
/// Owns the underlying byte stream and delegates reads and writes with
/// instrumentation: each successful call adds the byte count to the
/// connection counters and forwards it to the user record. Dropping the
/// connection emits one structured close log and releases the connection's
/// slot in the user's active-IP set.
pub struct InboundConn {
    // AtomicU64 guarantees the 64-bit alignment the counters need.
    sent: AtomicU64,
    recv: AtomicU64,
    stream: RewindStream<BoxStream>,
    user: Arc<User>,
    hash: String,
    envelope: Envelope,
    peer: SocketAddr,
    real_ip: IpAddr,
}

impl InboundConn {
    pub(crate) fn new(
        stream: RewindStream<BoxStream>,
        user: Arc<User>,
        hash: String,
        envelope: Envelope,
        peer: SocketAddr,
        real_ip: IpAddr,
    ) -> Self {
        Self {
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            stream,
            user,
            hash,
            envelope,
            peer,
            real_ip,
        }
    }

    /// The parsed request envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The credential hash the client presented.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The matched user record.
    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// TCP peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Attributed client address after consulting forwarding headers.
    pub fn real_ip(&self) -> IpAddr {
        self.real_ip
    }

    /// Bytes written to the client so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes read from the client so far.
    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }
}

impl AsyncRead for InboundConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let filled_before = buf.filled().len();
        match Pin::new(&mut self.stream).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - filled_before) as u64;
                self.recv.fetch_add(n, Ordering::Relaxed);
                self.user.add_recv_traffic(n);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for InboundConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.stream).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                self.sent.fetch_add(n as u64, Ordering::Relaxed);
                self.user.add_sent_traffic(n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Drop for InboundConn {
    fn drop(&mut self) {
        debug!(
            user = %self.hash,
            key_share = %self.user.key_share(),
            real_ip = %self.real_ip,
            peer = %self.peer,
            destination = %self.envelope.address,
            sent = %fmt_bytes(self.sent()),
            recv = %fmt_bytes(self.recv()),
            "connection closed"
        );
        self.user.remove_ip(self.real_ip);
    }
}

/// Derive the attributed client address from forwarding headers.
///
/// Headers are inspected in iteration order; the first match wins:
/// `X-Forwarded-For` contributes its first comma-separated entry,
/// `CF-Connecting-IP` is taken as-is. Values that do not parse as an IP
/// address are skipped. Without headers the TCP peer address stands.
pub(crate) fn real_client_ip(headers: Option<&[(String, String)]>, peer_ip: IpAddr) -> IpAddr {
    let Some(headers) = headers else {
        return peer_ip;
    };
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("X-Forwarded-For") {
            let first = value.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first.parse() {
                return ip;
            }
        } else if name.eq_ignore_ascii_case("CF-Connecting-IP") {
            if let Ok(ip) = value.trim().parse() {
                return ip;
            }
        }
    }
    peer_ip
}
