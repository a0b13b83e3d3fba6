//! Token authentication for websocket upgrades.
//!
//! The gateway only needs a user id out of a token, so the contract is a
//! single `validate` call. Production tokens are HMAC-signed JWTs issued by
//! the account service; the user id is the `sub` claim.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("token required")]
    MissingToken,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token has no subject")]
    MissingSubject,
    #[error("token validation timed out")]
    Timeout,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a token to the user id it was issued for.
    async fn validate(&self, token: &str) -> Result<String, AuthError>;
}

// =============================================================================
// JWT
// =============================================================================

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Accepts HS256/384/512 tokens signed with `secret`. `exp` is enforced
    /// when present; `sub` is required.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        // `sub` presence is checked on the decoded claims; `exp` stays optional.
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        Self { key: DecodingKey::from_secret(secret), validation }
    }

    fn decode_subject(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        match data.claims.sub {
            Some(sub) if !sub.is_empty() => Ok(sub),
            _ => Err(AuthError::MissingSubject),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn validate(&self, token: &str) -> Result<String, AuthError> {
        let user_id = self.decode_subject(token)?;
        debug!(%user_id, "auth: token valid");
        Ok(user_id)
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
