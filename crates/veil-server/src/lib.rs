//! Trojan-protocol tunneling server core.
//!
//! The server authenticates incoming byte streams by a shared-secret hash,
//! parses the embedded request envelope, and dispatches authenticated
//! connections to one of three bounded queues (stream, mux, packet) consumed
//! through [`Server::accept_stream`], [`Server::accept_mux`] and
//! [`Server::accept_packet`]. Any pre-authentication failure is redirected
//! byte-for-byte to a backing HTTP endpoint so the listener is
//! indistinguishable from an ordinary TLS-terminating web server.

mod api;
mod conn;
mod error;
pub mod forward;
mod handshake;
mod packet;
mod recorder;
mod redirect;
mod server;
mod tls;
mod underlay;

pub use conn::InboundConn;
pub use error::ServerError;
pub use packet::{PacketConn, PacketRecv, PacketSend};
pub use recorder::{Record, Recorder};
pub use redirect::{Redirection, Redirector};
pub use server::Server;
pub use tls::load_tls_config;
pub use underlay::{BoxStream, InboundStream, RawStream, TlsUnderlay, Underlay};

pub use tokio_util::sync::CancellationToken;
