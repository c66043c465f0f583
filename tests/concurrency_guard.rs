//! Concurrency guard integration tests

use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::Barrier;
use uuid::Uuid;

use bank_ledger::aggregate::Aggregate;
use bank_ledger::concurrency::{self, GuardError, ReadMode};
use bank_ledger::domain::{Amount, OperationContext};
use bank_ledger::handlers::{DepositCommand, MoneyHandler, TransferCommand, TransferHandler};
use bank_ledger::store::{IsolationLevel, StoreError};
use bank_ledger::AppError;

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_only_one_wins() {
    const WRITERS: usize = 8;

    let store = common::setup_store();
    let account_id = common::seed_checking(&store.memory, dec!(100));
    let barrier = Arc::new(Barrier::new(WRITERS));

    let mut tasks = Vec::new();
    for _ in 0..WRITERS {
        let storage = store.storage.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            let mut tx = storage.begin(IsolationLevel::ReadCommitted).await?;
            let mut account = concurrency::load(tx.as_mut(), account_id, ReadMode::Snapshot)
                .await
                .map_err(|e| match e {
                    GuardError::Store(e) => e,
                    other => StoreError::Corrupt(other.to_string()),
                })?;

            // every writer holds the same token before anyone writes
            barrier.wait().await;

            let amount = Amount::new(dec!(1)).expect("amount");
            account
                .credit(&amount, Uuid::new_v4(), None)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            concurrency::write(tx.as_mut(), &mut account).await?;
            tx.commit().await
        }));
    }

    let mut committed = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => committed += 1,
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(committed, 1);
    assert_eq!(conflicts, WRITERS - 1);

    let account = store.memory.account(account_id).unwrap();
    assert_eq!(account.balance().value(), dec!(101));
    assert_eq!(account.version().value(), 2);
}

#[tokio::test]
async fn test_stale_token_surfaces_as_version_conflict() {
    let store = common::setup_store();
    let account_id = common::seed_checking(&store.memory, dec!(10));

    let mut stale_tx = store.storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let mut stale = concurrency::load(stale_tx.as_mut(), account_id, ReadMode::Snapshot)
        .await
        .unwrap();

    MoneyHandler::new(store.storage.clone())
        .deposit(DepositCommand::new(account_id, "5"), &OperationContext::new())
        .await
        .unwrap();

    stale
        .credit(&Amount::new(dec!(1)).unwrap(), Uuid::new_v4(), None)
        .unwrap();
    let err = concurrency::write(stale_tx.as_mut(), &mut stale)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(AppError::from(err), AppError::VersionConflict));

    stale_tx.rollback().await.unwrap();
    assert_eq!(store.memory.account(account_id).unwrap().balance().value(), dec!(15));
}

#[tokio::test]
async fn test_missing_account_is_not_a_conflict() {
    let store = common::setup_store();
    let mut tx = store.storage.begin(IsolationLevel::ReadCommitted).await.unwrap();

    let err = concurrency::load(tx.as_mut(), Uuid::new_v4(), ReadMode::Locked)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::NotFound { entity: "Account", .. }));
    assert!(!err.is_conflict());
    assert!(matches!(AppError::from(err), AppError::AccountNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_preserve_total() {
    let store = common::setup_store();
    let a = common::seed_checking(&store.memory, dec!(500));
    let b = common::seed_checking(&store.memory, dec!(500));
    let handler = Arc::new(TransferHandler::new(store.storage.clone()));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let handler = handler.clone();
        let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
        tasks.push(tokio::spawn(async move {
            handler
                .execute(TransferCommand::new(from, to, "7"), &OperationContext::new())
                .await
        }));
    }

    let mut completed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => completed += 1,
            Err(AppError::VersionConflict) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(completed > 0);

    let balance_a = store.memory.account(a).unwrap().balance().value();
    let balance_b = store.memory.account(b).unwrap().balance().value();
    assert_eq!(balance_a + balance_b, dec!(1000));

    // three events per completed transfer, none for the losers
    assert_eq!(store.memory.outbox_records().len(), completed * 3);
}
