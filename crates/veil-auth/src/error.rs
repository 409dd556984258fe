//! Authentication error types.

/// Authentication backend error.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Backend error (database, network, etc.).
    #[error("backend error: {0}")]
    Backend(String),
}

impl AuthError {
    /// Create a backend error from any error type.
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }
}
