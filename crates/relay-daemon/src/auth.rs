//! Bearer-token authentication against hashed API keys.
//!
//! The daemon never stores raw tokens: issued keys are persisted as SHA-256
//! hex digests and every request is resolved by hashing the presented token.
//! The core only ever sees the resolved `user_id`.

use relay_db::{ApiKeyRecord, Database, UserRecord};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid API key")]
    InvalidToken,
    #[error("auth backend error: {0}")]
    Internal(String),
}

/// A freshly issued key. The raw token is only available here; afterwards
/// only the hash exists.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub token: String,
    pub record: ApiKeyRecord,
}

#[derive(Clone)]
pub struct AuthService {
    db: Database,
}

impl AuthService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Resolves a bearer token to its owning user. Revoked keys and unknown
    /// tokens are indistinguishable to the caller.
    pub async fn resolve(&self, token: &str) -> Result<UserRecord, AuthError> {
        let hash = Self::hash_token(token);
        let key = self
            .db
            .find_api_key_by_hash(&hash)
            .await
            .map_err(|err| AuthError::Internal(err.to_string()))?
            .ok_or(AuthError::InvalidToken)?;
        if key.is_revoked() {
            return Err(AuthError::InvalidToken);
        }
        self.db
            .fetch_user(key.user_id)
            .await
            .map_err(|err| AuthError::Internal(err.to_string()))?
            .ok_or(AuthError::InvalidToken)
    }

    /// Issues a new key for the user and returns the raw token once.
    pub async fn issue_key(
        &self,
        user_id: Uuid,
        label: Option<&str>,
    ) -> Result<IssuedKey, AuthError> {
        let token = format!(
            "rly_{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let record = self
            .db
            .insert_api_key(user_id, &Self::hash_token(&token), label)
            .await
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        Ok(IssuedKey { token, record })
    }
}
