//! Packet-connection adapter for ASSOCIATE streams.
//!
//! An ASSOCIATE stream carries a sequence of Trojan UDP frames. The adapter
//! exposes them as discrete datagrams; all bytes still flow through the
//! accounting connection underneath.

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};

use veil_proto::{read_udp_frame, write_udp_frame, Address};

use crate::conn::InboundConn;
use crate::error::ServerError;

/// A single ASSOCIATE session speaking Trojan UDP frames.
pub struct PacketConn {
    conn: InboundConn,
}

impl PacketConn {
    pub(crate) fn new(conn: InboundConn) -> Self {
        Self { conn }
    }

    /// The accounting connection underneath.
    pub fn conn(&self) -> &InboundConn {
        &self.conn
    }

    /// Receive the next datagram and its destination address.
    pub async fn recv_from(&mut self) -> Result<(Vec<u8>, Address), ServerError> {
        let (address, payload) = read_udp_frame(&mut self.conn).await?;
        Ok((payload, address))
    }

    /// Send one datagram attributed to the given source address.
    pub async fn send_to(&mut self, payload: &[u8], from: &Address) -> Result<(), ServerError> {
        let mut buf = BytesMut::with_capacity(payload.len() + 32);
        write_udp_frame(&mut buf, from, payload)?;
        self.conn.write_all(&buf).await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Split into independently owned receive and send halves, so a consumer
    /// can pump both directions concurrently.
    pub fn split(self) -> (PacketRecv, PacketSend) {
        let (rd, wr) = tokio::io::split(self.conn);
        (PacketRecv { rd }, PacketSend { wr })
    }
}

/// Receive half of a [`PacketConn`].
pub struct PacketRecv {
    rd: ReadHalf<InboundConn>,
}

impl PacketRecv {
    pub async fn recv_from(&mut self) -> Result<(Vec<u8>, Address), ServerError> {
        let (address, payload) = read_udp_frame(&mut self.rd).await?;
        Ok((payload, address))
    }
}

/// Send half of a [`PacketConn`].
pub struct PacketSend {
    wr: WriteHalf<InboundConn>,
}

impl PacketSend {
    pub async fn send_to(&mut self, payload: &[u8], from: &Address) -> Result<(), ServerError> {
        let mut buf = BytesMut::with_capacity(payload.len() + 32);
        write_udp_frame(&mut buf, from, payload)?;
        self.wr.write_all(&buf).await?;
        self.wr.flush().await?;
        Ok(())
    }
}
