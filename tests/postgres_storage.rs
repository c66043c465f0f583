//! PostgreSQL engine tests
//!
//! Need a reachable database: `DATABASE_URL=... cargo test -- --ignored`

use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use std::sync::Arc;
use uuid::Uuid;

use bank_ledger::aggregate::AccountType;
use bank_ledger::concurrency::{self, ReadMode};
use bank_ledger::domain::{Amount, OperationContext};
use bank_ledger::handlers::{AccountHandler, DepositCommand, MoneyHandler, OpenAccountCommand};
use bank_ledger::inbox::InboxRecord;
use bank_ledger::store::{IsolationLevel, PgStorage, StoreError, Storage};

const SCHEMA: &str = include_str!("../migrations/0001_reliability_core.sql");

async fn pg_storage() -> Arc<dyn Storage> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect");
    pool.execute(SCHEMA).await.expect("apply schema");
    Arc::new(PgStorage::new(pool))
}

async fn open_account(storage: &Arc<dyn Storage>) -> Uuid {
    AccountHandler::new(storage.clone())
        .open(
            OpenAccountCommand::new(Uuid::new_v4(), AccountType::Checking, "EUR"),
            &OperationContext::new(),
        )
        .await
        .expect("open account")
        .account_id
}

#[tokio::test]
#[ignore]
async fn test_mutation_and_outbox_commit_together() {
    let storage = pg_storage().await;
    let account_id = open_account(&storage).await;

    let result = MoneyHandler::new(storage.clone())
        .deposit(DepositCommand::new(account_id, "12.34"), &OperationContext::new())
        .await
        .unwrap();

    let account = storage.find_account(account_id).await.unwrap().unwrap();
    assert_eq!(account.balance().value(), result.balance_after);

    let mut tx = storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let claimed = tx.claim_pending_outbox(1000).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(claimed.iter().any(|r| r.event_type == "MoneyCredited" && r.payload.contains(&account_id.to_string())));
}

#[tokio::test]
#[ignore]
async fn test_stale_version_is_rejected() {
    let storage = pg_storage().await;
    let account_id = open_account(&storage).await;

    let mut stale_tx = storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let mut stale = concurrency::load(stale_tx.as_mut(), account_id, ReadMode::Snapshot)
        .await
        .unwrap();

    MoneyHandler::new(storage.clone())
        .deposit(DepositCommand::new(account_id, "1"), &OperationContext::new())
        .await
        .unwrap();

    stale
        .credit(&Amount::new(rust_decimal::Decimal::ONE).unwrap(), Uuid::new_v4(), None)
        .unwrap();
    let err = concurrency::write(stale_tx.as_mut(), &mut stale)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
    stale_tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_claimed_records_are_skipped_by_other_dispatchers() {
    let storage = pg_storage().await;
    open_account(&storage).await;

    let mut first = storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let claimed = first.claim_pending_outbox(1000).await.unwrap();
    assert!(!claimed.is_empty());

    let mut second = storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let overlap = second.claim_pending_outbox(1000).await.unwrap();
    assert!(overlap.iter().all(|r| claimed.iter().all(|c| c.id != r.id)));

    second.rollback().await.unwrap();
    first.rollback().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_inbox_marker_is_unique() {
    let storage = pg_storage().await;
    let message_id = Uuid::new_v4();

    let mut tx = storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.record_inbox(&InboxRecord::new(message_id, "client-blocked")).await.unwrap();
    tx.commit().await.unwrap();
    assert!(storage.inbox_contains(message_id, "client-blocked").await.unwrap());

    let mut tx = storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let err = tx
        .record_inbox(&InboxRecord::new(message_id, "client-blocked"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateMessage { .. }));
    tx.rollback().await.unwrap();
}
