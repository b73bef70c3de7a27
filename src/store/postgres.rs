use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{StoreError, TokenStore, TokenTx};
use crate::models::token::{NewToken, TokenRecord};

const TOKEN_COLUMNS: &str = "id, hashed_value, encrypted_value, encryption_nonce, owner_label, \
                             bound_device_id, last_used_at, expires_at, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// `op_timeout` bounds both waiting for a pooled connection and every
    /// statement on it, COMMIT included.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let statement_timeout_ms = op_timeout.as_millis();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(op_timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn map_insert_error(err: sqlx::Error) -> StoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Duplicate,
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn find_by_hash(&self, hashed_value: &str) -> Result<Option<TokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, TokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE hashed_value = $1"
        ))
        .bind(hashed_value)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, TokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_by_owner(&self, owner_label: &str) -> Result<Vec<TokenRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE owner_label = $1 ORDER BY created_at DESC"
        ))
        .bind(owner_label)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn insert(&self, token: &NewToken) -> Result<Uuid, StoreError> {
        sqlx::query_scalar::<_, Uuid>(
            r#"INSERT INTO tokens (hashed_value, encrypted_value, encryption_nonce, owner_label, expires_at)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id"#,
        )
        .bind(&token.hashed_value)
        .bind(&token.encrypted_value)
        .bind(&token.encryption_nonce)
        .bind(&token.owner_label)
        .bind(token.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error)
    }

    async fn begin(&self) -> Result<Box<dyn TokenTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTokenTx {
            tx: Some(tx),
            locked: None,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Row-locking transaction. Dropping it without `commit` rolls back and
/// returns the connection to the pool.
pub struct PgTokenTx {
    tx: Option<Transaction<'static, Postgres>>,
    locked: Option<Uuid>,
}

impl PgTokenTx {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl TokenTx for PgTokenTx {
    async fn lock_by_hash(&mut self, hashed_value: &str) -> Result<Option<TokenRecord>, StoreError> {
        let tx = self.tx()?;
        // FOR UPDATE serializes concurrent validators of the same row only.
        let row = sqlx::query_as::<_, TokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE hashed_value = $1 FOR UPDATE"
        ))
        .bind(hashed_value)
        .fetch_optional(&mut **tx)
        .await?;

        self.locked = row.as_ref().map(|r| r.id);
        Ok(row)
    }

    async fn record_use(
        &mut self,
        id: Uuid,
        bind_device: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.locked != Some(id) {
            return Err(StoreError::NotLocked(id));
        }
        let tx = self.tx()?;
        // A recorded device is never overwritten.
        sqlx::query(
            "UPDATE tokens SET last_used_at = $2, bound_device_id = COALESCE(bound_device_id, $3) WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .bind(bind_device)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.rollback().await?;
        Ok(())
    }
}
