use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A stored access token. The plaintext never appears here: `hashed_value`
/// is the lookup key and `encrypted_value`/`encryption_nonce` allow recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TokenRecord {
    pub id: Uuid,
    pub hashed_value: String,
    #[serde(skip)]
    pub encrypted_value: Vec<u8>,
    #[serde(skip)]
    pub encryption_nonce: Vec<u8>,
    pub owner_label: String,
    pub bound_device_id: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    /// `true` once `now` is strictly past `expires_at`. Tokens without an
    /// expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Short, non-reversible handle for log lines.
    pub fn log_tag(&self) -> &str {
        &self.hashed_value[..self.hashed_value.len().min(8)]
    }
}

/// Insert payload; identity and `created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub hashed_value: String,
    pub encrypted_value: Vec<u8>,
    pub encryption_nonce: Vec<u8>,
    pub owner_label: String,
    pub expires_at: Option<DateTime<Utc>>,
}
