//! Credential stores for the veil server.
//!
//! The server core consumes the [`Authenticator`] trait: a lookup from a
//! 56-byte hex credential hash to a live [`User`] record. User records carry
//! the per-user traffic counters and the active-IP set that enforces the
//! concurrent-IP limit.
//!
//! # Example
//!
//! ```
//! use veil_auth::{sha224_hex, Authenticator, MemoryAuthenticator};
//!
//! # async fn example() {
//! let auth = MemoryAuthenticator::from_passwords(["my_password"], 0);
//! let user = auth.auth_user(&sha224_hex("my_password")).await;
//! assert!(user.is_some());
//! # }
//! ```

mod error;
mod hash;
mod memory;
#[cfg(feature = "mysql")]
mod mysql;
mod user;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::AuthError;
pub use hash::sha224_hex;
pub use memory::MemoryAuthenticator;
#[cfg(feature = "mysql")]
pub use mysql::{MySqlAuthenticator, MySqlAuthenticatorConfig};
pub use user::User;

/// Credential lookup consumed by the server core.
///
/// Implementations must be thread-safe; lookups run concurrently from every
/// accepted connection. A `None` result means the hash identifies no valid
/// user, which the caller treats as an authentication failure.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Look up a user record by its lowercase hex SHA-224 credential hash.
    async fn auth_user(&self, hash: &str) -> Option<Arc<User>>;

    /// Enumerate live user records, for management surfaces.
    ///
    /// Backends without cheap enumeration may return an empty list.
    fn users(&self) -> Vec<Arc<User>> {
        Vec::new()
    }
}

#[async_trait]
impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    async fn auth_user(&self, hash: &str) -> Option<Arc<User>> {
        (**self).auth_user(hash).await
    }

    fn users(&self) -> Vec<Arc<User>> {
        (**self).users()
    }
}
