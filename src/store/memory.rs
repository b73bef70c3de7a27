use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{StoreError, TokenStore, TokenTx};
use crate::models::token::{NewToken, TokenRecord};

/// In-process store. Committed rows are readable without waiting; each row
/// also has its own async mutex that only transactions take, so
/// transactions on different tokens never contend and plain reads never
/// wait on an in-flight validation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: DashMap<String, TokenRecord>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    ids: DashMap<Uuid, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rows.is_empty()
    }

    fn committed(&self, hashed_value: &str) -> Option<TokenRecord> {
        self.inner.rows.get(hashed_value).map(|r| r.value().clone())
    }

    fn row_lock(&self, hashed_value: &str) -> Arc<Mutex<()>> {
        // Clone the handle out so no shard lock is held across an await.
        Arc::clone(
            self.inner
                .locks
                .entry(hashed_value.to_owned())
                .or_default()
                .value(),
        )
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn find_by_hash(&self, hashed_value: &str) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.committed(hashed_value))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TokenRecord>, StoreError> {
        let hashed_value = match self.inner.ids.get(&id) {
            Some(h) => h.value().clone(),
            None => return Ok(None),
        };
        Ok(self.committed(&hashed_value))
    }

    async fn list_by_owner(&self, owner_label: &str) -> Result<Vec<TokenRecord>, StoreError> {
        let mut out: Vec<TokenRecord> = self
            .inner
            .rows
            .iter()
            .filter(|r| r.owner_label == owner_label)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn insert(&self, token: &NewToken) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        match self.inner.rows.entry(token.hashed_value.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(TokenRecord {
                    id,
                    hashed_value: token.hashed_value.clone(),
                    encrypted_value: token.encrypted_value.clone(),
                    encryption_nonce: token.encryption_nonce.clone(),
                    owner_label: token.owner_label.clone(),
                    bound_device_id: None,
                    last_used_at: None,
                    expires_at: token.expires_at,
                    created_at: Utc::now(),
                });
                self.inner.ids.insert(id, token.hashed_value.clone());
                Ok(id)
            }
        }
    }

    async fn begin(&self) -> Result<Box<dyn TokenTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            guard: None,
            locked: None,
            staged: None,
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Holds the row's mutex for its whole lifetime; writes are staged and only
/// published on commit.
pub struct MemoryTx {
    store: MemoryStore,
    guard: Option<OwnedMutexGuard<()>>,
    locked: Option<TokenRecord>,
    staged: Option<TokenRecord>,
    finished: bool,
}

#[async_trait]
impl TokenTx for MemoryTx {
    async fn lock_by_hash(&mut self, hashed_value: &str) -> Result<Option<TokenRecord>, StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        if self.store.committed(hashed_value).is_none() {
            return Ok(None);
        }
        let guard = self.store.row_lock(hashed_value).lock_owned().await;
        // Re-read under the lock: a previous holder may have committed.
        let Some(record) = self.store.committed(hashed_value) else {
            return Ok(None);
        };
        self.guard = Some(guard);
        self.locked = Some(record.clone());
        self.staged = None;
        Ok(Some(record))
    }

    async fn record_use(
        &mut self,
        id: Uuid,
        bind_device: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        let current = match (&self.staged, &self.locked) {
            (Some(staged), _) => staged.clone(),
            (None, Some(locked)) => locked.clone(),
            (None, None) => return Err(StoreError::NotLocked(id)),
        };
        if current.id != id {
            return Err(StoreError::NotLocked(id));
        }

        let mut next = current;
        next.last_used_at = Some(at);
        if next.bound_device_id.is_none() {
            next.bound_device_id = bind_device.map(str::to_owned);
        }
        self.staged = Some(next);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        self.finished = true;
        if let (Some(_), Some(staged)) = (self.guard.as_ref(), self.staged.take()) {
            self.store.inner.rows.insert(staged.hashed_value.clone(), staged);
        }
        self.locked = None;
        self.guard = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        self.finished = true;
        self.staged = None;
        self.locked = None;
        self.guard = None;
        Ok(())
    }
}
