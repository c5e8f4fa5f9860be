//! Bearer-credential validation for the WebSocket upgrade.
//!
//! The hub core only sees the [`Authenticator`] trait; the concrete
//! implementation validates HS256 JWTs whose claims carry the user id, the
//! shape the rest of the platform issues at login.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upgrade-time credential failure. Reported synchronously to the connecting
/// client; never seen inside the core afterward.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

/// Validates a bearer credential and yields the connecting user's identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<Uuid, AuthError>;
}

/// Access-token claims. `user_id` is the registry identity.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    #[serde(default)]
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 JWT validator over a shared signing secret.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Issue an access token for a user. Used by the login flow and by tests.
    pub fn issue_token(
        &self,
        user_id: Uuid,
        username: &str,
        ttl_secs: i64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id,
            username: username.to_owned(),
            iat: now,
            exp: now + ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn validate(&self, credential: &str) -> Result<Uuid, AuthError> {
        let data = decode::<Claims>(credential, &self.decoding, &Validation::default())
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            })?;
        Ok(data.claims.user_id)
    }
}

/// Load or generate the JWT signing key (256-bit random secret), stored as
/// raw bytes at `data_dir/jwt_secret`.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let auth = JwtAuthenticator::new(b"test-secret-test-secret-test-sec");
        let user = Uuid::new_v4();
        let token = auth.issue_token(user, "anna", 60).unwrap();
        assert_eq!(auth.validate(&token).await.unwrap(), user);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let auth = JwtAuthenticator::new(b"test-secret-test-secret-test-sec");
        let token = auth.issue_token(Uuid::new_v4(), "anna", -120).unwrap();
        assert!(matches!(
            auth.validate(&token).await,
            Err(AuthError::Expired)
        ));
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let auth = JwtAuthenticator::new(b"test-secret-test-secret-test-sec");
        assert!(matches!(
            auth.validate("not-a-jwt").await,
            Err(AuthError::Invalid)
        ));
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let issuer = JwtAuthenticator::new(b"one-secret-one-secret-one-secret");
        let verifier = JwtAuthenticator::new(b"two-secret-two-secret-two-secret");
        let token = issuer.issue_token(Uuid::new_v4(), "anna", 60).unwrap();
        assert!(matches!(
            verifier.validate(&token).await,
            Err(AuthError::Invalid)
        ));
    }
}
