//! Row locking, binding and uniqueness against the Postgres backend.
//!
//! These tests verify:
//! 1. `SELECT ... FOR UPDATE` lets exactly one of N racing devices bind a token
//! 2. A recorded device is never overwritten by a later `record_use`
//! 3. A unique violation on insert surfaces as `StoreError::Duplicate`
//! 4. A held row lock stalls only validations of that row, not plain reads
//!
//! **Requirements:**
//! - PostgreSQL running at DATABASE_URL
//! - Run with `cargo test --test postgres_store -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use devicelock::errors::AppError;
use devicelock::models::token::NewToken;
use devicelock::store::postgres::PgStore;
use devicelock::store::{StoreError, TokenStore, TokenTx};
use devicelock::tokens::expiration::ExpirationInput;
use devicelock::tokens::generator::TokenGenerator;
use devicelock::tokens::issuance::{IssueRequest, TokenIssuer};
use devicelock::tokens::validator::{DeviceBindingValidator, ValidationOutcome};
use devicelock::vault::crypto::{hash_token, TokenCrypto};
use futures::future::join_all;
use uuid::Uuid;

const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

async fn pg() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a PostgreSQL");
    let store = PgStore::connect(&url, 40, Duration::from_secs(10))
        .await
        .expect("connect to DATABASE_URL");
    store.migrate().await.expect("run migrations");
    store
}

fn issuer(store: &PgStore) -> TokenIssuer {
    TokenIssuer::new(
        Arc::new(store.clone()),
        Arc::new(TokenCrypto::new(MASTER_KEY).unwrap()),
        TokenGenerator::new(12, 8),
        None,
    )
}

/// Owner label unique to this run so rows from earlier runs never interfere.
fn owner() -> String {
    format!("pg-test-{}", Uuid::new_v4())
}

async fn issue(store: &PgStore) -> String {
    issuer(store)
        .issue(IssueRequest {
            owner: Some(owner()),
            custom_token: None,
            expiration: Some(ExpirationInput::Text("never".into())),
        })
        .await
        .unwrap()
        .token
}

fn new_token(hashed_value: &str) -> NewToken {
    NewToken {
        hashed_value: hashed_value.into(),
        encrypted_value: vec![1, 2, 3],
        encryption_nonce: vec![0; 12],
        owner_label: owner(),
        expires_at: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_racing_devices_bind_exactly_once() {
    const DEVICES: usize = 16;

    let store = pg().await;
    let token = issue(&store).await;
    let v = Arc::new(DeviceBindingValidator::new(
        Arc::new(store.clone()),
        Duration::from_secs(10),
    ));

    let tasks = (0..DEVICES).map(|i| {
        let v = Arc::clone(&v);
        let token = token.clone();
        tokio::spawn(async move { v.validate(&token, Some(&format!("device-{i}"))).await })
    });
    let outcomes: Vec<ValidationOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            ValidationOutcome::Granted(g) => Some(g.clone()),
            _ => None,
        })
        .collect();
    let conflicts = outcomes
        .iter()
        .filter(|o| **o == ValidationOutcome::DeviceConflict)
        .count();

    assert_eq!(winners.len(), 1);
    assert!(winners[0].first_binding);
    assert_eq!(conflicts, DEVICES - 1);

    let record = store.find_by_hash(&hash_token(&token)).await.unwrap().unwrap();
    assert_eq!(record.bound_device_id, winners[0].bound_device_id);
}

#[tokio::test]
#[ignore]
async fn test_recorded_device_is_never_overwritten() {
    let store = pg().await;
    let hashed_value = hash_token(&Uuid::new_v4().to_string());
    let id = store.insert(&new_token(&hashed_value)).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.lock_by_hash(&hashed_value).await.unwrap().unwrap();
    tx.record_use(id, Some("dev-1"), Utc::now()).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.lock_by_hash(&hashed_value).await.unwrap().unwrap();
    tx.record_use(id, Some("dev-2"), Utc::now()).await.unwrap();
    tx.commit().await.unwrap();

    let record = store.find_by_hash(&hashed_value).await.unwrap().unwrap();
    assert_eq!(record.bound_device_id.as_deref(), Some("dev-1"));
    assert!(record.last_used_at.is_some());
}

#[tokio::test]
#[ignore]
async fn test_uncommitted_bind_is_rolled_back_on_drop() {
    let store = pg().await;
    let hashed_value = hash_token(&Uuid::new_v4().to_string());
    let id = store.insert(&new_token(&hashed_value)).await.unwrap();

    {
        let mut tx = store.begin().await.unwrap();
        tx.lock_by_hash(&hashed_value).await.unwrap().unwrap();
        tx.record_use(id, Some("dev-1"), Utc::now()).await.unwrap();
    }

    let record = store.find_by_hash(&hashed_value).await.unwrap().unwrap();
    assert!(record.bound_device_id.is_none());
    assert!(record.last_used_at.is_none());
}

#[tokio::test]
#[ignore]
async fn test_duplicate_hash_is_rejected() {
    let store = pg().await;
    let hashed_value = hash_token(&Uuid::new_v4().to_string());
    store.insert(&new_token(&hashed_value)).await.unwrap();

    let err = store.insert(&new_token(&hashed_value)).await.unwrap_err();
    assert!(matches!(err, StoreError::Duplicate));

    let custom = Uuid::new_v4().simple().to_string();
    let request = || IssueRequest {
        owner: Some(owner()),
        custom_token: Some(custom.clone()),
        expiration: None,
    };
    issuer(&store).issue(request()).await.unwrap();
    let err = issuer(&store).issue(request()).await.unwrap_err();
    assert!(matches!(err, AppError::DuplicateToken));
}

#[tokio::test]
#[ignore]
async fn test_row_lock_stalls_only_validations_of_that_row() {
    let store = pg().await;
    let busy = issue(&store).await;
    let free = issue(&store).await;
    let v = DeviceBindingValidator::new(Arc::new(store.clone()), Duration::from_millis(300));

    let mut holder = store.begin().await.unwrap();
    holder.lock_by_hash(&hash_token(&busy)).await.unwrap().unwrap();

    match v.validate(&free, Some("D1")).await.unwrap() {
        ValidationOutcome::Granted(grant) => assert!(grant.first_binding),
        other => panic!("expected a grant, got {:?}", other),
    }

    let err = v.validate(&busy, Some("D1")).await.unwrap_err();
    assert!(matches!(err, AppError::TransactionTimeout(_)));

    // Plain reads are not blocked by the lock.
    let seen = tokio::time::timeout(
        Duration::from_millis(300),
        store.find_by_hash(&hash_token(&busy)),
    )
    .await
    .expect("find_by_hash waited on the row lock")
    .unwrap()
    .unwrap();
    assert!(seen.bound_device_id.is_none());

    holder.rollback().await.unwrap();
    let v = DeviceBindingValidator::new(Arc::new(store.clone()), Duration::from_secs(10));
    match v.validate(&busy, Some("D1")).await.unwrap() {
        ValidationOutcome::Granted(grant) => assert!(grant.first_binding),
        other => panic!("expected a grant, got {:?}", other),
    }
}
