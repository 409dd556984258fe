//! In-memory credential store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::hash::sha224_hex;
use crate::user::User;
use crate::Authenticator;

/// Credential store backed by a fixed hash map.
///
/// Suitable for deployments whose user set comes from the config file. For
/// dynamic user management use a database-backed store.
pub struct MemoryAuthenticator {
    users: HashMap<String, Arc<User>>,
}

impl MemoryAuthenticator {
    /// Build from plaintext passwords; each is hashed with SHA-224.
    /// `ip_limit` caps concurrent distinct client addresses per user
    /// (0 = unlimited).
    pub fn from_passwords<I, S>(passwords: I, ip_limit: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let users = passwords
            .into_iter()
            .map(|p| {
                let hash = sha224_hex(p.as_ref());
                let user = Arc::new(User::new(p.as_ref(), hash.clone(), ip_limit));
                (hash, user)
            })
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn auth_user(&self, hash: &str) -> Option<Arc<User>> {
        self.users.get(hash).cloned()
    }

    fn users(&self) -> Vec<Arc<User>> {
        self.users.values().cloned().collect()
    }
}
