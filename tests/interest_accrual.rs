//! Interest accrual integration tests

use chrono::{Days, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bank_ledger::aggregate::AccountType;
use bank_ledger::config::AccrualConfig;
use bank_ledger::domain::OperationContext;
use bank_ledger::handlers::{AccountHandler, CloseAccountCommand, MoneyHandler, WithdrawCommand};
use bank_ledger::jobs::{AccrualOrchestrator, AccrualWorker, JobError, TokioJobQueue};

mod common;

fn accrual_config(batch_size: i64) -> AccrualConfig {
    AccrualConfig {
        batch_size,
        interval: Duration::from_secs(3600),
    }
}

#[tokio::test]
async fn test_run_fans_out_into_batches() {
    let store = common::setup_store();
    for _ in 0..1200 {
        common::seed_deposit(&store.memory, dec!(100), dec!(2), 30);
    }

    let queue = Arc::new(common::RecordingQueue::default());
    let orchestrator = AccrualOrchestrator::new(store.storage.clone(), queue.clone(), accrual_config(500));
    let today = Utc::now().date_naive();

    let report = orchestrator.schedule(today).await.unwrap();
    assert_eq!(report.eligible, 1200);
    assert_eq!(report.jobs, 3);

    let jobs = queue.jobs();
    assert_eq!(jobs.iter().map(|j| j.page).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(jobs.iter().all(|j| j.run_id == report.run_id && j.correlation_id == report.run_id));
    assert!(jobs.iter().all(|j| j.as_of == today && j.batch_size == 500));

    let worker = AccrualWorker::new(store.storage.clone());
    let cancel = CancellationToken::new();
    let mut processed = Vec::new();
    for job in &jobs {
        processed.push(worker.run(job, &cancel).await.unwrap().processed);
    }
    assert_eq!(processed, vec![500, 500, 200]);
    assert_eq!(store.memory.outbox_records().len(), 1200);
}

#[tokio::test]
async fn test_empty_run_schedules_nothing() {
    let store = common::setup_store();
    common::seed_checking(&store.memory, dec!(1000));
    common::seed_deposit(&store.memory, dec!(0), dec!(5), 30);

    let queue = Arc::new(common::RecordingQueue::default());
    let orchestrator = AccrualOrchestrator::new(store.storage.clone(), queue.clone(), accrual_config(500));

    let report = orchestrator.schedule(Utc::now().date_naive()).await.unwrap();
    assert_eq!(report.eligible, 0);
    assert_eq!(report.jobs, 0);
    assert!(queue.jobs().is_empty());
}

#[tokio::test]
async fn test_closed_accounts_are_not_eligible() {
    let store = common::setup_store();
    let eligible = common::seed_deposit(&store.memory, dec!(100), dec!(5), 30);
    let closing = common::seed_deposit(&store.memory, dec!(10), dec!(5), 30);

    MoneyHandler::new(store.storage.clone())
        .withdraw(WithdrawCommand::new(closing, "10"), &OperationContext::new())
        .await
        .unwrap();
    AccountHandler::new(store.storage.clone())
        .close(
            CloseAccountCommand {
                account_id: closing,
            },
            &OperationContext::new(),
        )
        .await
        .unwrap();

    let queue = Arc::new(common::RecordingQueue::default());
    let orchestrator = AccrualOrchestrator::new(store.storage.clone(), queue.clone(), accrual_config(500));
    let report = orchestrator.schedule(Utc::now().date_naive()).await.unwrap();
    assert_eq!(report.eligible, 1);

    let outcome = AccrualWorker::new(store.storage.clone())
        .run(&queue.jobs()[0], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.processed, 1);
    assert!(store.memory.account(eligible).unwrap().last_accrual_date().is_some());
    assert!(store.memory.account(closing).unwrap().last_accrual_date().is_none());
}

#[tokio::test]
async fn test_account_at_balance_cap_does_not_block_page() {
    let store = common::setup_store();
    let healthy = common::seed_deposit(&store.memory, dec!(1000), dec!(5), 30);
    let capped = common::seed_deposit(&store.memory, dec!(999999999999.00), dec!(5), 30);

    let queue = Arc::new(common::RecordingQueue::default());
    let orchestrator = AccrualOrchestrator::new(store.storage.clone(), queue.clone(), accrual_config(500));
    orchestrator.schedule(Utc::now().date_naive()).await.unwrap();

    let outcome = AccrualWorker::new(store.storage.clone())
        .run(&queue.jobs()[0], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.accrued, 1);
    assert_eq!(outcome.skipped, 1);

    assert!(store.memory.account(healthy).unwrap().last_accrual_date().is_some());
    let capped = store.memory.account(capped).unwrap();
    assert!(capped.last_accrual_date().is_none());
    assert_eq!(capped.balance().value(), dec!(999999999999.00));
    assert_eq!(store.memory.outbox_records().len(), 1);
}

#[tokio::test]
async fn test_simple_interest_amount_and_idempotent_rerun() {
    let store = common::setup_store();
    let account_id = common::seed_deposit(&store.memory, dec!(1000), dec!(3.65), 10);

    let queue = Arc::new(common::RecordingQueue::default());
    let orchestrator = AccrualOrchestrator::new(store.storage.clone(), queue.clone(), accrual_config(500));
    let worker = AccrualWorker::new(store.storage.clone());
    let cancel = CancellationToken::new();
    let today = Utc::now().date_naive();

    orchestrator.schedule(today).await.unwrap();
    let outcome = worker.run(&queue.jobs()[0], &cancel).await.unwrap();
    assert_eq!(outcome.accrued, 1);
    assert_eq!(outcome.total_interest, dec!(1.00));

    let account = store.memory.account(account_id).unwrap();
    assert_eq!(account.balance().value(), dec!(1001.00));
    assert_eq!(account.last_accrual_date(), Some(today));

    let record = store.memory.outbox_records().remove(0);
    assert_eq!(record.event_type, "InterestAccrued");
    let envelope: serde_json::Value = serde_json::from_str(&record.payload).unwrap();
    let amount: Decimal = envelope["payload"]["amount"].as_str().unwrap().parse().unwrap();
    assert_eq!(amount, dec!(1.00));
    assert_eq!(envelope["meta"]["correlationId"], queue.jobs()[0].run_id.to_string());
    assert_eq!(envelope["meta"]["causationId"], queue.jobs()[0].job_id.to_string());

    // same date again: nothing more is due
    orchestrator.schedule(today).await.unwrap();
    let rerun = worker.run(&queue.jobs()[1], &cancel).await.unwrap();
    assert_eq!(rerun.processed, 1);
    assert_eq!(rerun.accrued, 0);
    assert_eq!(store.memory.account(account_id).unwrap().balance().value(), dec!(1001.00));
    assert_eq!(store.memory.outbox_records().len(), 1);

    // the next day only books the new day
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap();
    orchestrator.schedule(tomorrow).await.unwrap();
    let next = worker.run(&queue.jobs()[2], &cancel).await.unwrap();
    assert_eq!(next.accrued, 1);
    assert_eq!(next.total_interest, dec!(0.10));
}

#[tokio::test]
async fn test_cancelled_batch_rolls_back() {
    let store = common::setup_store();
    let ids: Vec<Uuid> = (0..10)
        .map(|_| common::seed_deposit(&store.memory, dec!(1000), dec!(5), 30))
        .collect();

    let queue = Arc::new(common::RecordingQueue::default());
    let orchestrator = AccrualOrchestrator::new(store.storage.clone(), queue.clone(), accrual_config(500));
    orchestrator.schedule(Utc::now().date_naive()).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = AccrualWorker::new(store.storage.clone())
        .run(&queue.jobs()[0], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Cancelled));

    for id in ids {
        let account = store.memory.account(id).unwrap();
        assert_eq!(account.balance().value(), dec!(1000));
        assert!(account.last_accrual_date().is_none());
    }
    assert!(store.memory.outbox_records().is_empty());
}

#[tokio::test]
async fn test_tokio_queue_runs_and_drains_jobs() {
    let store = common::setup_store();
    for _ in 0..25 {
        common::seed_deposit(&store.memory, dec!(365), dec!(10), 1);
    }
    let checking = common::seed_account(
        &store.memory,
        Uuid::new_v4(),
        AccountType::Checking,
        dec!(365),
        None,
        1,
    );

    let cancel = CancellationToken::new();
    let queue = Arc::new(TokioJobQueue::new(
        Arc::new(AccrualWorker::new(store.storage.clone())),
        cancel.clone(),
    ));
    let orchestrator = AccrualOrchestrator::new(store.storage.clone(), queue.clone(), accrual_config(10));

    let report = orchestrator.schedule(Utc::now().date_naive()).await.unwrap();
    assert_eq!(report.jobs, 3);

    queue.drain().await;
    assert_eq!(queue.in_flight(), 0);

    // 365 * 10% / 365 days = 0.10 per account
    let records = store.memory.outbox_records();
    assert_eq!(records.len(), 25);
    assert!(records.iter().all(|r| r.event_type == "InterestAccrued"));
    assert_eq!(store.memory.account(checking).unwrap().balance().value(), dec!(365));

    // a drained queue refuses new work
    assert!(matches!(
        orchestrator.schedule(Utc::now().date_naive()).await,
        Err(JobError::Queue(_))
    ));
}
