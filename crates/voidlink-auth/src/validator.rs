//! Pluggable authentication seam
//!
//! The control engine only depends on this trait, so deployments can swap
//! the JWT verifier for an API-key table or an external service without
//! touching the protocol code.

use async_trait::async_trait;
use thiserror::Error;

/// Identity recovered from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Tunnel id the token was issued for (JWT `sub`).
    pub tunnel_id: String,
}

impl AuthResult {
    pub fn new(tunnel_id: String) -> Self {
        Self { tunnel_id }
    }
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// Validates an authentication token presented in an `AUTH` handshake.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthResult, AuthError>;
}
