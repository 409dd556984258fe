//! Raw byte-stream redirection to the fallback HTTP backend.
//!
//! Anything that fails authentication is spliced, byte-for-byte, to a real
//! HTTP server. The client sees exactly what it would have seen talking to
//! that server directly; the redirector never writes a byte of its own.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use veil_core::defaults::{DEFAULT_SPLICE_BUFFER_SIZE, DEFAULT_SPLICE_IDLE_TIMEOUT_SECS};
use veil_core::io::splice_bidirectional;

use crate::underlay::BoxStream;

/// One redirection request. The redirector owns the stream from here on and
/// is responsible for closing it.
pub struct Redirection {
    pub target: SocketAddr,
    pub stream: BoxStream,
    pub peer: SocketAddr,
}

/// Splices rejected streams to the fallback backend on detached tasks.
pub struct Redirector {
    cancel: CancellationToken,
}

impl Redirector {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Start redirecting. Non-blocking; the task ends when either side
    /// closes, the splice goes idle, or the server shuts down.
    pub fn redirect(&self, redirection: Redirection) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let Redirection {
                target,
                stream,
                peer,
            } = redirection;

            let backend = match TcpStream::connect(target).await {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(peer = %peer, target = %target, error = %err, "redirect dial failed");
                    return;
                }
            };

            let idle = Duration::from_secs(DEFAULT_SPLICE_IDLE_TIMEOUT_SECS);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(peer = %peer, "redirect aborted by shutdown");
                }
                res = splice_bidirectional(stream, backend, idle, DEFAULT_SPLICE_BUFFER_SIZE) => {
                    match res {
                        Ok(stats) => {
                            debug!(peer = %peer, target = %target, bytes = stats.total(), "redirect finished");
                        }
                        Err(err) => {
                            debug!(peer = %peer, target = %target, error = %err, "redirect ended with error");
                        }
                    }
                }
            }
        });
    }
}
