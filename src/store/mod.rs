//! Token persistence.
//!
//! Two backends implement [`TokenStore`]: [`postgres::PgStore`] for
//! production and [`memory::MemoryStore`] for local runs and tests. Both give
//! the same guarantee for [`TokenTx`]: a row loaded with
//! [`TokenTx::lock_by_hash`] stays locked against other transactions until
//! the handle is committed or dropped, and dropping an uncommitted handle
//! discards its writes.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::token::{NewToken, TokenRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a token with this hashed value already exists")]
    Duplicate,

    #[error("token row {0} is not locked by this transaction")]
    NotLocked(Uuid),

    #[error("transaction already finished")]
    Finished,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read/insert access plus per-row transactions.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn find_by_hash(&self, hashed_value: &str) -> Result<Option<TokenRecord>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TokenRecord>, StoreError>;

    async fn list_by_owner(&self, owner_label: &str) -> Result<Vec<TokenRecord>, StoreError>;

    /// Single atomic insert. Fails with [`StoreError::Duplicate`] when the
    /// hashed value is already taken.
    async fn insert(&self, token: &NewToken) -> Result<Uuid, StoreError>;

    /// Opens a unit of work. The returned handle owns its connection.
    async fn begin(&self) -> Result<Box<dyn TokenTx>, StoreError>;

    /// Cheap liveness probe used by the readiness endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// A transaction scoped to a single token row.
#[async_trait]
pub trait TokenTx: Send {
    /// Loads the row and holds its lock until commit or drop.
    async fn lock_by_hash(&mut self, hashed_value: &str) -> Result<Option<TokenRecord>, StoreError>;

    /// Refreshes `last_used_at` and, when `bind_device` is set, records it
    /// as the bound device if none is recorded yet. Only valid for the row
    /// locked by this transaction.
    async fn record_use(
        &mut self,
        id: Uuid,
        bind_device: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Ends the transaction without writing. Dropping the handle has the
    /// same effect; this just releases the row eagerly.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}
