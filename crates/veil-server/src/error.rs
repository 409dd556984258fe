//! Server error types.

use veil_proto::ProtoError;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("proto: {0}")]
    Proto(#[from] ProtoError),
    #[error("config: {0}")]
    Config(String),
    /// The server context was cancelled; acceptors return this.
    #[error("server closed")]
    Closed,
}
