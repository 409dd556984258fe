//! The authentication handshake.
//!
//! Reads, in order: the 56-byte credential hash, CRLF, the request envelope,
//! CRLF. Failures before the credential and its IP slot are accepted are
//! *rejections*: the caller rewinds the stream and hands it to the
//! redirector, and the server never writes a byte of its own. Failures after
//! that point mean the client authenticated but is broken; the connection is
//! closed silently.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use veil_auth::{Authenticator, User};
use veil_core::io::RewindStream;
use veil_proto::{read_crlf, Envelope, HASH_LEN};

use crate::conn::real_client_ip;
use crate::error::ServerError;
use crate::underlay::BoxStream;

/// Successful handshake: everything needed to build an accounting
/// connection. The IP slot claimed during the handshake transfers to the
/// connection, which releases it on close.
pub(crate) struct Authed {
    pub user: Arc<User>,
    pub hash: String,
    pub envelope: Envelope,
    pub real_ip: IpAddr,
}

pub(crate) enum HandshakeError {
    /// Pre-auth failure: rewind and redirect. The reason is logged, never
    /// sent to the client.
    Reject(String),
    /// Post-auth failure: close the connection silently.
    Protocol(ServerError),
}

impl From<ServerError> for HandshakeError {
    fn from(err: ServerError) -> Self {
        HandshakeError::Protocol(err)
    }
}

/// Releases a claimed IP slot unless the handshake completes.
struct IpSlot<'a> {
    user: &'a Arc<User>,
    ip: IpAddr,
    armed: bool,
}

impl IpSlot<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for IpSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.user.remove_ip(self.ip);
        }
    }
}

pub(crate) async fn authenticate<A>(
    stream: &mut RewindStream<BoxStream>,
    auth: &A,
    peer: SocketAddr,
    headers: Option<&[(String, String)]>,
) -> Result<Authed, HandshakeError>
where
    A: Authenticator + ?Sized,
{
    let mut hash_buf = [0u8; HASH_LEN];
    if let Err(err) = stream.read_exact(&mut hash_buf).await {
        return Err(HandshakeError::Reject(format!(
            "failed to read hash: {err}"
        )));
    }
    let hash = match std::str::from_utf8(&hash_buf) {
        Ok(v) => v,
        Err(_) => {
            return Err(HandshakeError::Reject("hash is not valid ASCII".into()));
        }
    };

    let Some(user) = auth.auth_user(hash).await else {
        return Err(HandshakeError::Reject(format!("invalid hash: {hash}")));
    };

    let real_ip = real_client_ip(headers, peer.ip());
    if !user.add_ip(real_ip) {
        return Err(HandshakeError::Reject(format!(
            "ip limit reached, key_share: {} hash: {} real_ip: {}",
            user.key_share(),
            hash,
            real_ip
        )));
    }
    let slot = IpSlot {
        user: &user,
        ip: real_ip,
        armed: true,
    };

    // The credential is valid and its IP slot is claimed: from here on a
    // failure closes the connection instead of redirecting. Capture can
    // stop; nothing past this point is ever replayed.
    stream.stop_buffering();

    read_crlf(stream).await.map_err(ServerError::Proto)?;
    let envelope = Envelope::read_from(stream)
        .await
        .map_err(ServerError::Proto)?;
    read_crlf(stream).await.map_err(ServerError::Proto)?;

    slot.disarm();
    Ok(Authed {
        hash: hash.to_string(),
        user,
        envelope,
        real_ip,
    })
}
