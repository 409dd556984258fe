//! Trojan envelope and UDP frame wire codec.
//!
//! The request envelope follows the credential hash and its CRLF separator
//! on an authenticated stream:
//!
//! ```text
//! +-----+--------+----------+------+
//! | CMD | ATYP   | ADDRESS  | PORT |
//! +-----+--------+----------+------+
//! | 1   | 1      | variable | 2    |
//! +-----+--------+----------+------+
//! ```
//!
//! ASSOCIATE streams then carry a sequence of UDP frames:
//!
//! ```text
//! +--------+----------+------+--------+---------+----------+
//! | ATYP   | ADDRESS  | PORT | LENGTH | X'0D0A' | PAYLOAD  |
//! +--------+----------+------+--------+---------+----------+
//! ```
//!
//! All integers are network byte order. The codec performs no DNS
//! resolution; domain addresses are carried as-is.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use veil_core::defaults::{MAX_DOMAIN_LEN, MAX_UDP_PAYLOAD};

pub const CRLF: &[u8; 2] = b"\r\n";

/// Credential hash length (SHA-224 hex).
pub const HASH_LEN: usize = veil_core::defaults::HASH_LEN;

/// Domain-name sentinel marking a multiplexed stream carried under CONNECT.
/// Legacy compatibility path; collides with a real destination of the same
/// name, which is accepted protocol folklore.
pub const MUX_SENTINEL: &str = "MUX_CONN";

const CMD_CONNECT: u8 = 0x01;
const CMD_ASSOCIATE: u8 = 0x03;
// Trojan multiplexing extension; fixed protocol constant.
const CMD_MUX: u8 = 0x7f;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Errors produced while decoding or encoding protocol data.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    #[error("unknown address type {0:#04x}")]
    UnknownAddressType(u8),
    #[error("zero-length domain name")]
    EmptyDomain,
    #[error("domain name exceeds {MAX_DOMAIN_LEN} bytes")]
    DomainTooLong,
    #[error("domain name is not valid ASCII")]
    InvalidDomainEncoding,
    #[error("missing CRLF separator")]
    MissingCrlf,
    #[error("udp payload exceeds {MAX_UDP_PAYLOAD} bytes")]
    PayloadTooLarge,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ProtoError {
    /// Whether the error is a short read (peer closed mid-header) rather
    /// than a protocol violation.
    pub fn is_short_read(&self) -> bool {
        matches!(self, ProtoError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// TCP stream tunnel.
    Connect,
    /// UDP-over-TCP packet tunnel.
    Associate,
    /// Multiplexed stream tunnel.
    Mux,
}

impl Command {
    pub fn from_byte(b: u8) -> Result<Self, ProtoError> {
        match b {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_ASSOCIATE => Ok(Command::Associate),
            CMD_MUX => Ok(Command::Mux),
            other => Err(ProtoError::UnknownCommand(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Connect => CMD_CONNECT,
            Command::Associate => CMD_ASSOCIATE,
            Command::Mux => CMD_MUX,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => write!(f, "CONNECT"),
            Command::Associate => write!(f, "ASSOCIATE"),
            Command::Mux => write!(f, "MUX"),
        }
    }
}

/// Destination host: literal IP or unresolved domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// Destination address carried in an envelope or UDP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: Host,
    pub port: u16,
}

impl Address {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn from_socket(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        Self {
            host,
            port: addr.port(),
        }
    }

    /// The domain name, when the host is a domain.
    pub fn domain(&self) -> Option<&str> {
        match &self.host {
            Host::Domain(d) => Some(d),
            _ => None,
        }
    }

    /// Whether this address is the mux sentinel domain.
    pub fn is_mux_sentinel(&self) -> bool {
        self.domain() == Some(MUX_SENTINEL)
    }

    /// Read an address (ATYP + host + port) from the stream.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        let host = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                Host::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProtoError::EmptyDomain);
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                if !name.is_ascii() {
                    return Err(ProtoError::InvalidDomainEncoding);
                }
                let name =
                    String::from_utf8(name).map_err(|_| ProtoError::InvalidDomainEncoding)?;
                Host::Domain(name)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                Host::Ipv6(Ipv6Addr::from(octets))
            }
            other => return Err(ProtoError::UnknownAddressType(other)),
        };
        let port = r.read_u16().await?;
        Ok(Self { host, port })
    }

    /// Append ATYP + host + port to a buffer.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        match &self.host {
            Host::Ipv4(ip) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Host::Ipv6(ip) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Host::Domain(name) => {
                if name.is_empty() {
                    return Err(ProtoError::EmptyDomain);
                }
                if name.len() > MAX_DOMAIN_LEN {
                    return Err(ProtoError::DomainTooLong);
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_u16(self.port);
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Host::Domain(d) => write!(f, "{}:{}", d, self.port),
        }
    }
}

/// The request envelope: command plus destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub command: Command,
    pub address: Address,
}

impl Envelope {
    /// Decode an envelope from the stream. Fails on an unknown command or
    /// address type, a zero-length domain, or a short read.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        let command = Command::from_byte(r.read_u8().await?)?;
        let address = Address::read_from(r).await?;
        Ok(Self { command, address })
    }

    /// Append CMD + ATYP + host + port to a buffer.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        buf.put_u8(self.command.as_byte());
        self.address.write_to(buf)
    }
}

/// Read the two-byte CRLF separator, rejecting anything else.
pub async fn read_crlf<R>(r: &mut R) -> Result<(), ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut sep = [0u8; 2];
    r.read_exact(&mut sep).await?;
    if &sep != CRLF {
        return Err(ProtoError::MissingCrlf);
    }
    Ok(())
}

/// Read one UDP frame (address, length, CRLF, payload) from the stream.
pub async fn read_udp_frame<R>(r: &mut R) -> Result<(Address, Vec<u8>), ProtoError>
where
    R: AsyncRead + Unpin,
{
    let address = Address::read_from(r).await?;
    let len = r.read_u16().await? as usize;
    if len > MAX_UDP_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge);
    }
    read_crlf(r).await?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((address, payload))
}

/// Append one UDP frame to a buffer.
pub fn write_udp_frame(
    buf: &mut BytesMut,
    address: &Address,
    payload: &[u8],
) -> Result<(), ProtoError> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge);
    }
    address.write_to(buf)?;
    buf.put_u16(payload.len() as u16);
    buf.put_slice(CRLF);
    buf.put_slice(payload);
    Ok(())
}

/// Encode and send a full client request head: hash, CRLF, envelope, CRLF.
/// Used by tests and client-side tooling.
pub async fn write_request_head<W>(
    w: &mut W,
    hash_hex: &str,
    envelope: &Envelope,
) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(HASH_LEN + 2 + 32);
    buf.put_slice(hash_hex.as_bytes());
    buf.put_slice(CRLF);
    envelope.write_to(&mut buf)?;
    buf.put_slice(CRLF);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn roundtrip(envelope: Envelope) -> Envelope {
        let mut buf = BytesMut::new();
        envelope.write_to(&mut buf).unwrap();
        let mut slice: &[u8] = &buf;
        Envelope::read_from(&mut slice).await.unwrap()
    }

    #[tokio::test]
    async fn envelope_roundtrip_ipv4() {
        let envelope = Envelope {
            command: Command::Connect,
            address: Address::new(Host::Ipv4(Ipv4Addr::new(192, 168, 1, 1)), 80),
        };
        assert_eq!(roundtrip(envelope.clone()).await, envelope);
    }

    #[tokio::test]
    async fn envelope_roundtrip_ipv6() {
        let envelope = Envelope {
            command: Command::Associate,
            address: Address::new(Host::Ipv6(Ipv6Addr::LOCALHOST), 53),
        };
        assert_eq!(roundtrip(envelope.clone()).await, envelope);
    }

    #[tokio::test]
    async fn envelope_roundtrip_domain() {
        let envelope = Envelope {
            command: Command::Mux,
            address: Address::new(Host::Domain("ex.com".into()), 443),
        };
        assert_eq!(roundtrip(envelope.clone()).await, envelope);
    }

    #[tokio::test]
    async fn rejects_unknown_command() {
        let data = [0x02u8, ATYP_IPV4, 1, 2, 3, 4, 0, 80];
        let mut slice: &[u8] = &data;
        let err = Envelope::read_from(&mut slice).await.unwrap_err();
        assert!(matches!(err, ProtoError::UnknownCommand(0x02)));
    }

    #[tokio::test]
    async fn rejects_unknown_atyp() {
        let data = [CMD_CONNECT, 0x05u8, 0, 0];
        let mut slice: &[u8] = &data;
        let err = Envelope::read_from(&mut slice).await.unwrap_err();
        assert!(matches!(err, ProtoError::UnknownAddressType(0x05)));
    }

    #[tokio::test]
    async fn rejects_empty_domain() {
        let data = [CMD_CONNECT, ATYP_DOMAIN, 0x00];
        let mut slice: &[u8] = &data;
        let err = Envelope::read_from(&mut slice).await.unwrap_err();
        assert!(matches!(err, ProtoError::EmptyDomain));
    }

    #[tokio::test]
    async fn short_read_is_distinguished() {
        let data = [CMD_CONNECT, ATYP_IPV4, 1, 2];
        let mut slice: &[u8] = &data;
        let err = Envelope::read_from(&mut slice).await.unwrap_err();
        assert!(err.is_short_read());
    }

    #[tokio::test]
    async fn mux_sentinel_detection() {
        let addr = Address::new(Host::Domain(MUX_SENTINEL.into()), 443);
        assert!(addr.is_mux_sentinel());
        let addr = Address::new(Host::Domain("example.com".into()), 443);
        assert!(!addr.is_mux_sentinel());
    }

    #[tokio::test]
    async fn udp_frame_roundtrip() {
        let addr = Address::new(Host::Ipv4(Ipv4Addr::new(8, 8, 8, 8)), 53);
        let mut buf = BytesMut::new();
        write_udp_frame(&mut buf, &addr, b"ping").unwrap();

        let mut slice: &[u8] = &buf;
        let (parsed, payload) = read_udp_frame(&mut slice).await.unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn udp_frame_rejects_bad_crlf() {
        let addr = Address::new(Host::Ipv4(Ipv4Addr::new(8, 8, 8, 8)), 53);
        let mut buf = BytesMut::new();
        addr.write_to(&mut buf).unwrap();
        buf.put_u16(4);
        buf.put_slice(b"xx");
        buf.put_slice(b"ping");

        let mut slice: &[u8] = &buf;
        let err = read_udp_frame(&mut slice).await.unwrap_err();
        assert!(matches!(err, ProtoError::MissingCrlf));
    }

    #[tokio::test]
    async fn oversized_udp_payload_rejected() {
        let addr = Address::new(Host::Ipv4(Ipv4Addr::new(1, 1, 1, 1)), 53);
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_UDP_PAYLOAD + 1];
        assert!(matches!(
            write_udp_frame(&mut buf, &addr, &payload),
            Err(ProtoError::PayloadTooLarge)
        ));
    }

    #[tokio::test]
    async fn request_head_over_stream() {
        let (mut client, mut server) = duplex(256);
        let envelope = Envelope {
            command: Command::Connect,
            address: Address::new(Host::Domain("crates.io".into()), 443),
        };
        let hash = "a".repeat(HASH_LEN);

        let send = envelope.clone();
        let write_hash = hash.clone();
        tokio::spawn(async move {
            write_request_head(&mut client, &write_hash, &send)
                .await
                .unwrap();
        });

        let mut hash_buf = [0u8; HASH_LEN];
        server.read_exact(&mut hash_buf).await.unwrap();
        assert_eq!(hash_buf, hash.as_bytes());
        read_crlf(&mut server).await.unwrap();
        let parsed = Envelope::read_from(&mut server).await.unwrap();
        assert_eq!(parsed, envelope);
        read_crlf(&mut server).await.unwrap();
    }
}
