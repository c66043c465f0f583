//! Mutation/outbox atomicity tests
//!
//! A command either persists its state change and its outbox record
//! together, or neither.

use rust_decimal_macros::dec;
use uuid::Uuid;

use bank_ledger::aggregate::{AccountType, Aggregate};
use bank_ledger::domain::OperationContext;
use bank_ledger::handlers::{
    AccountHandler, DepositCommand, MoneyHandler, OpenAccountCommand, TransferCommand,
    TransferHandler,
};
use bank_ledger::outbox;
use bank_ledger::store::IsolationLevel;
use bank_ledger::AppError;

mod common;

#[tokio::test]
async fn test_deposit_persists_state_and_record_together() {
    let store = common::setup_store();
    let account_id = common::seed_checking(&store.memory, dec!(10));
    let handler = MoneyHandler::new(store.storage.clone());

    let context = OperationContext::new();
    handler
        .deposit(DepositCommand::new(account_id, "2.50"), &context)
        .await
        .unwrap();

    let account = store.memory.account(account_id).unwrap();
    assert_eq!(account.balance().value(), dec!(12.50));

    let records = store.memory.outbox_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type, "MoneyCredited");
    assert!(records[0].is_pending());
    assert_eq!(records[0].correlation_id, context.correlation_id);
}

#[tokio::test]
async fn test_crash_before_commit_leaves_no_orphan() {
    let store = common::setup_store();
    let account_id = common::seed_checking(&store.memory, dec!(10));
    let handler = MoneyHandler::new(store.storage.clone());

    store.memory.fail_next_commits(1);
    let err = handler
        .deposit(DepositCommand::new(account_id, "5"), &OperationContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unavailable(_)));

    // neither the balance change nor the event survived
    assert_eq!(store.memory.account(account_id).unwrap().balance().value(), dec!(10));
    assert!(store.memory.outbox_records().is_empty());

    // and the next attempt goes through cleanly
    handler
        .deposit(DepositCommand::new(account_id, "5"), &OperationContext::new())
        .await
        .unwrap();
    assert_eq!(store.memory.account(account_id).unwrap().balance().value(), dec!(15));
    assert_eq!(store.memory.outbox_records().len(), 1);
}

#[tokio::test]
async fn test_failed_outbox_insert_discards_mutation() {
    let store = common::setup_store();
    let account_id = common::seed_checking(&store.memory, dec!(10));
    let handler = MoneyHandler::new(store.storage.clone());

    store.memory.reject_outbox_inserts(true);
    let result = handler
        .deposit(DepositCommand::new(account_id, "5"), &OperationContext::new())
        .await;
    store.memory.reject_outbox_inserts(false);

    assert!(result.is_err());
    let account = store.memory.account(account_id).unwrap();
    assert_eq!(account.balance().value(), dec!(10));
    assert_eq!(account.version().value(), 1);
}

#[tokio::test]
async fn test_open_account_without_commit_is_invisible() {
    let store = common::setup_store();
    let handler = AccountHandler::new(store.storage.clone());

    store.memory.fail_next_commits(1);
    let result = handler
        .open(
            OpenAccountCommand::new(Uuid::new_v4(), AccountType::Checking, "EUR"),
            &OperationContext::new(),
        )
        .await;

    assert!(result.is_err());
    assert!(store.memory.outbox_records().is_empty());
}

#[tokio::test]
async fn test_transfer_is_all_or_nothing() {
    let store = common::setup_store();
    let from = common::seed_checking(&store.memory, dec!(100));
    let to = common::seed_checking(&store.memory, dec!(0));
    let handler = TransferHandler::new(store.storage.clone());

    store.memory.fail_next_commits(1);
    assert!(handler
        .execute(TransferCommand::new(from, to, "30"), &OperationContext::new())
        .await
        .is_err());

    assert_eq!(store.memory.account(from).unwrap().balance().value(), dec!(100));
    assert_eq!(store.memory.account(to).unwrap().balance().value(), dec!(0));
    assert!(store.memory.outbox_records().is_empty());
}

#[tokio::test]
async fn test_staged_record_invisible_until_commit() {
    let store = common::setup_store();
    let account_id = common::seed_checking(&store.memory, dec!(0));
    let event = bank_ledger::AccountEvent::AccountClosed {
        account_id,
        closed_at: chrono::Utc::now(),
    };

    let mut tx = store.storage.begin(IsolationLevel::ReadCommitted).await.unwrap();
    let id = outbox::stage(tx.as_mut(), &event, &OperationContext::new())
        .await
        .unwrap();
    assert!(store.storage.outbox_record(id).await.unwrap().is_none());

    tx.commit().await.unwrap();
    assert!(store.storage.outbox_record(id).await.unwrap().is_some());
}
