//! Device binding state machine.
//!
//! ```text
//! UNBOUND  --(first validation, any device)--> BOUND(device)
//! BOUND(d) --(validation, device == d)-------> BOUND(d)   last_used_at refreshed
//! BOUND(d) --(validation, device != d)-------> rejected   no write
//! (any)    --(now > expires_at)--------------> rejected   no write, checked first
//! ```
//!
//! Each validation is one store transaction holding the token's row lock from
//! read to commit, so two devices racing for the same unbound token cannot
//! both bind it. Different tokens never share a lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::AppError;
use crate::models::token::TokenRecord;
use crate::store::{TokenStore, TokenTx};
use crate::vault::crypto::hash_token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub owner: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when this validation performed the binding.
    pub first_binding: bool,
    pub bound_device_id: Option<String>,
    /// `last_used_at` as it was before this validation.
    pub previous_use: Option<DateTime<Utc>>,
}

/// Result of a validation. Rejections are ordinary outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Granted(Grant),
    NotFound,
    Expired,
    DeviceConflict,
}

impl ValidationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ValidationOutcome::Granted(g) if g.first_binding => "granted_first_binding",
            ValidationOutcome::Granted(_) => "granted",
            ValidationOutcome::NotFound => "not_found",
            ValidationOutcome::Expired => "expired",
            ValidationOutcome::DeviceConflict => "device_conflict",
        }
    }
}

/// What to do with a locked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Expired,
    Bind,
    Refresh,
    Conflict,
}

pub(crate) fn decide(record: &TokenRecord, device_id: Option<&str>, now: DateTime<Utc>) -> Step {
    if record.is_expired_at(now) {
        return Step::Expired;
    }
    match (device_id, record.bound_device_id.as_deref()) {
        (None, _) => Step::Refresh,
        (Some(_), None) => Step::Bind,
        (Some(presented), Some(bound)) if presented == bound => Step::Refresh,
        (Some(_), Some(_)) => Step::Conflict,
    }
}

pub struct DeviceBindingValidator {
    store: Arc<dyn TokenStore>,
    tx_timeout: Duration,
}

impl DeviceBindingValidator {
    pub fn new(store: Arc<dyn TokenStore>, tx_timeout: Duration) -> Self {
        Self { store, tx_timeout }
    }

    /// Checks `token` and, when `device_id` is given, binds or matches it.
    /// A blank device id counts as absent: only existence and expiry are
    /// checked and the usage timestamp is refreshed.
    pub async fn validate(
        &self,
        token: &str,
        device_id: Option<&str>,
    ) -> Result<ValidationOutcome, AppError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::InvalidInput("token"));
        }
        let device_id = device_id.map(str::trim).filter(|d| !d.is_empty());
        let hashed_value = hash_token(token);

        // On timeout the in-flight transaction is dropped, which rolls it
        // back and frees the row.
        let pending = self.lock_and_decide(&hashed_value, device_id);
        let settled = match tokio::time::timeout(self.tx_timeout, pending).await {
            Ok(settled) => settled?,
            Err(_) => {
                tracing::error!(
                    token = %&hashed_value[..8],
                    timeout = ?self.tx_timeout,
                    "validation transaction timed out"
                );
                return Err(AppError::TransactionTimeout(self.tx_timeout));
            }
        };

        let (mut tx, record, step) = match settled {
            Settled::Rejected(outcome) => return Ok(outcome),
            Settled::Pending { tx, record, step } => (tx, record, step),
        };

        // Outside the deadline: once COMMIT is sent the write may be durable,
        // so its outcome is whatever the store reports. The store's own
        // statement timeout bounds it.
        tx.commit().await?;

        let first_binding = step == Step::Bind;
        if first_binding {
            tracing::info!(
                token_id = %record.id,
                token = %record.log_tag(),
                device = device_id.unwrap_or_default(),
                "validation: token bound to device"
            );
        } else {
            tracing::debug!(token_id = %record.id, token = %record.log_tag(), "validation: granted");
        }

        Ok(ValidationOutcome::Granted(Grant {
            owner: record.owner_label,
            expires_at: record.expires_at,
            first_binding,
            bound_device_id: if first_binding {
                device_id.map(str::to_owned)
            } else {
                record.bound_device_id
            },
            previous_use: record.last_used_at,
        }))
    }

    /// Everything up to, but not including, the commit.
    async fn lock_and_decide(
        &self,
        hashed_value: &str,
        device_id: Option<&str>,
    ) -> Result<Settled, AppError> {
        let mut tx = self.store.begin().await?;

        let Some(record) = tx.lock_by_hash(hashed_value).await? else {
            finish_without_write(&mut *tx).await;
            tracing::info!(token = %&hashed_value[..8], "validation: token not found");
            return Ok(Settled::Rejected(ValidationOutcome::NotFound));
        };

        // Judged at decision time, after any lock wait.
        let now = Utc::now();
        let step = decide(&record, device_id, now);

        match step {
            Step::Expired => {
                finish_without_write(&mut *tx).await;
                tracing::info!(token_id = %record.id, token = %record.log_tag(), "validation: token expired");
                Ok(Settled::Rejected(ValidationOutcome::Expired))
            }
            Step::Conflict => {
                finish_without_write(&mut *tx).await;
                tracing::warn!(
                    token_id = %record.id,
                    token = %record.log_tag(),
                    presented = device_id.unwrap_or_default(),
                    "validation: token is bound to another device"
                );
                Ok(Settled::Rejected(ValidationOutcome::DeviceConflict))
            }
            Step::Bind | Step::Refresh => {
                let bind = if step == Step::Bind { device_id } else { None };
                tx.record_use(record.id, bind, now).await?;
                Ok(Settled::Pending { tx, record, step })
            }
        }
    }
}

/// A validation either rejected without writing, or holds a written but
/// uncommitted transaction.
enum Settled {
    Rejected(ValidationOutcome),
    Pending {
        tx: Box<dyn TokenTx>,
        record: TokenRecord,
        step: Step,
    },
}

/// Rejections write nothing. A failed rollback is only logged: the handle is
/// dropped right after, which discards the transaction anyway.
async fn finish_without_write(tx: &mut dyn TokenTx) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!("rollback after rejected validation failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn record(bound: Option<&str>, expires_at: Option<DateTime<Utc>>) -> TokenRecord {
        TokenRecord {
            id: Uuid::new_v4(),
            hashed_value: "feedfacecafebeef".into(),
            encrypted_value: vec![],
            encryption_nonce: vec![],
            owner_label: "acme".into(),
            bound_device_id: bound.map(str::to_owned),
            last_used_at: None,
            expires_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_unbound_token_binds() {
        assert_eq!(decide(&record(None, None), Some("dev-1"), Utc::now()), Step::Bind);
    }

    #[test]
    fn test_same_device_refreshes() {
        assert_eq!(
            decide(&record(Some("dev-1"), None), Some("dev-1"), Utc::now()),
            Step::Refresh
        );
    }

    #[test]
    fn test_other_device_conflicts() {
        assert_eq!(
            decide(&record(Some("dev-1"), None), Some("dev-2"), Utc::now()),
            Step::Conflict
        );
    }

    #[test]
    fn test_no_device_only_refreshes() {
        let now = Utc::now();
        assert_eq!(decide(&record(None, None), None, now), Step::Refresh);
        assert_eq!(decide(&record(Some("dev-1"), None), None, now), Step::Refresh);
    }

    #[test]
    fn test_expiry_wins_over_everything() {
        let now = Utc::now();
        let past = Some(now - ChronoDuration::seconds(1));
        assert_eq!(decide(&record(None, past), Some("dev-1"), now), Step::Expired);
        assert_eq!(decide(&record(Some("dev-1"), past), Some("dev-1"), now), Step::Expired);
        assert_eq!(decide(&record(Some("dev-1"), past), Some("dev-2"), now), Step::Expired);
        assert_eq!(decide(&record(None, past), None, now), Step::Expired);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ValidationOutcome::DeviceConflict.label(), "device_conflict");
        assert_eq!(ValidationOutcome::Expired.label(), "expired");
        assert_eq!(ValidationOutcome::NotFound.label(), "not_found");
    }
}
