//! HS256 JWT verification and minting

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::validator::{AuthError, AuthResult, AuthValidator};

/// Claims carried by a VoidLink client token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (tunnel id)
    pub sub: String,
    /// Issued at (unix timestamp)
    pub iat: i64,
    /// Expiration (unix timestamp)
    pub exp: i64,
}

impl JwtClaims {
    pub fn new(tunnel_id: String, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: tunnel_id,
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
        }
    }
}

/// Verifies HS256-signed tokens against a shared secret.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<JwtClaims, AuthError> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;
        Ok(data.claims)
    }

    /// Mint a token with the shared secret. Used by the `generate-token`
    /// CLI command; the relay itself never issues tokens.
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, AuthError> {
        let header = Header::new(Algorithm::HS256);
        encode(&header, claims, &EncodingKey::from_secret(secret))
            .map_err(|e| AuthError::AuthenticationFailed(e.to_string()))
    }
}

#[async_trait]
impl AuthValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<AuthResult, AuthError> {
        let claims = self.verify(token)?;
        Ok(AuthResult::new(claims.sub))
    }
}
