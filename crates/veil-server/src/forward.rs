//! Downstream consumers used by the binary.
//!
//! The server core hands authenticated connections off through its queues
//! and never dials out itself. These forwarders are the built-in consumers:
//! a direct TCP forwarder for stream connections and a UDP relay for packet
//! sessions. Mux-bearing connections are drained and dropped unless a
//! multiplexer subsystem is attached in their place.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, warn};

use veil_core::defaults::{
    DEFAULT_SPLICE_BUFFER_SIZE, DEFAULT_SPLICE_IDLE_TIMEOUT_SECS, DEFAULT_UDP_TIMEOUT_SECS,
    MAX_UDP_PAYLOAD,
};
use veil_core::io::splice_bidirectional;
use veil_proto::{Address, Host};

use crate::conn::InboundConn;
use crate::error::ServerError;
use crate::packet::{PacketConn, PacketRecv, PacketSend};
use crate::server::Server;

/// Resolve an envelope address to a dialable socket address.
async fn resolve(address: &Address) -> io::Result<SocketAddr> {
    match &address.host {
        Host::Ipv4(ip) => Ok(SocketAddr::new((*ip).into(), address.port)),
        Host::Ipv6(ip) => Ok(SocketAddr::new((*ip).into(), address.port)),
        Host::Domain(name) => lookup_host((name.as_str(), address.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {name}"))
            }),
    }
}

/// Drive the stream queue: dial each destination and splice.
pub async fn run_stream_forwarder(server: Arc<Server>) -> Result<(), ServerError> {
    loop {
        let conn = match server.accept_stream().await {
            Ok(conn) => conn,
            Err(ServerError::Closed) => return Ok(()),
            Err(err) => return Err(err),
        };
        tokio::spawn(async move {
            let destination = conn.envelope().address.clone();
            if let Err(err) = forward_stream(conn).await {
                debug!(destination = %destination, error = %err, "stream forward ended");
            }
        });
    }
}

async fn forward_stream(conn: InboundConn) -> Result<(), ServerError> {
    let target = resolve(&conn.envelope().address).await?;
    let outbound = TcpStream::connect(target).await?;
    outbound.set_nodelay(true).ok();
    debug!(peer = %conn.peer(), target = %target, "target connected");

    splice_bidirectional(
        conn,
        outbound,
        Duration::from_secs(DEFAULT_SPLICE_IDLE_TIMEOUT_SECS),
        DEFAULT_SPLICE_BUFFER_SIZE,
    )
    .await?;
    Ok(())
}

/// Drive the packet queue: one UDP socket per session.
pub async fn run_packet_forwarder(server: Arc<Server>) -> Result<(), ServerError> {
    loop {
        let session = match server.accept_packet().await {
            Ok(session) => session,
            Err(ServerError::Closed) => return Ok(()),
            Err(err) => return Err(err),
        };
        tokio::spawn(async move {
            let peer = session.conn().peer();
            if let Err(err) = forward_packets(session).await {
                debug!(peer = %peer, error = %err, "packet forward ended");
            }
        });
    }
}

/// Bind an unspecified UDP socket, dual-stack where the host allows it.
fn bind_udp() -> io::Result<std::net::UdpSocket> {
    if let Ok(socket) = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)) {
        socket.set_only_v6(false).ok();
        socket.set_nonblocking(true)?;
        let addr = SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0));
        if socket.bind(&addr.into()).is_ok() {
            return Ok(socket.into());
        }
    }
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn forward_packets(session: PacketConn) -> Result<(), ServerError> {
    let std_socket = bind_udp()?;
    let socket = Arc::new(UdpSocket::from_std(std_socket)?);
    let dual_stack = socket.local_addr()?.is_ipv6();
    let (rx, tx) = session.split();

    let outbound = client_to_target(rx, socket.clone(), dual_stack);
    let inbound = target_to_client(tx, socket);
    tokio::pin!(outbound, inbound);

    tokio::select! {
        res = &mut outbound => res,
        res = &mut inbound => res,
    }
}

async fn client_to_target(
    mut rx: PacketRecv,
    socket: Arc<UdpSocket>,
    dual_stack: bool,
) -> Result<(), ServerError> {
    loop {
        let (payload, address) = match rx.recv_from().await {
            Ok(frame) => frame,
            // Client closed the stream; session over.
            Err(ServerError::Proto(err)) if err.is_short_read() => return Ok(()),
            Err(err) => return Err(err),
        };
        let mut target = match resolve(&address).await {
            Ok(target) => target,
            Err(err) => {
                debug!(destination = %address, error = %err, "udp resolve failed, dropping packet");
                continue;
            }
        };
        // A dual-stack v6 socket reaches v4 targets through mapped addresses.
        if dual_stack {
            if let SocketAddr::V4(v4) = target {
                target = SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port());
            }
        }
        if let Err(err) = socket.send_to(&payload, target).await {
            debug!(target = %target, error = %err, "udp send failed");
        }
    }
}

async fn target_to_client(mut tx: PacketSend, socket: Arc<UdpSocket>) -> Result<(), ServerError> {
    let idle = Duration::from_secs(DEFAULT_UDP_TIMEOUT_SECS);
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        let (n, from) = match tokio::time::timeout(idle, socket.recv_from(&mut buf)).await {
            Ok(res) => res?,
            // No response traffic for a while; let the session end.
            Err(_) => return Ok(()),
        };
        let from = SocketAddr::new(from.ip().to_canonical(), from.port());
        tx.send_to(&buf[..n], &Address::from_socket(from)).await?;
    }
}

/// Drain the mux queue. The multiplexer lives in its own subsystem; without
/// one attached, mux connections are logged and closed.
pub async fn run_mux_drain(server: Arc<Server>) -> Result<(), ServerError> {
    loop {
        match server.accept_mux().await {
            Ok(conn) => {
                warn!(peer = %conn.peer(), "no mux subsystem attached, dropping mux connection");
            }
            Err(ServerError::Closed) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}
