//! Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use bank_ledger::aggregate::{Account, AccountType, Aggregate};
use bank_ledger::broker::memory::InMemoryBroker;
use bank_ledger::broker::InboundMessage;
use bank_ledger::config::{ConsumerConfig, DispatcherConfig};
use bank_ledger::domain::{Balance, CurrencyCode};
use bank_ledger::jobs::{AccrualJob, JobError, JobQueue};
use bank_ledger::outbox::{OutboxDispatcher, OutboxPublisher};
use bank_ledger::store::{MemoryStorage, Storage};

/// Memory storage plus the same storage behind the trait object
pub struct TestStore {
    pub memory: MemoryStorage,
    pub storage: Arc<dyn Storage>,
}

pub fn setup_store() -> TestStore {
    let memory = MemoryStorage::new();
    TestStore {
        storage: Arc::new(memory.clone()),
        memory,
    }
}

/// Seed an open account with a balance, backdated by `opened_days_ago`
pub fn seed_account(
    store: &MemoryStorage,
    owner_id: Uuid,
    account_type: AccountType,
    balance: Decimal,
    rate: Option<Decimal>,
    opened_days_ago: i64,
) -> Uuid {
    let (account, _) = Account::open(
        Uuid::new_v4(),
        owner_id,
        account_type,
        CurrencyCode::new("EUR").expect("currency"),
        rate,
    )
    .expect("open account");

    let account = account
        .with_balance(Balance::new(balance).expect("balance"))
        .with_opened_at(Utc::now() - ChronoDuration::days(opened_days_ago));
    let id = account.id();
    store.seed_account(account);
    id
}

pub fn seed_checking(store: &MemoryStorage, balance: Decimal) -> Uuid {
    seed_account(store, Uuid::new_v4(), AccountType::Checking, balance, None, 0)
}

pub fn seed_deposit(store: &MemoryStorage, balance: Decimal, rate: Decimal, opened_days_ago: i64) -> Uuid {
    seed_account(
        store,
        Uuid::new_v4(),
        AccountType::Deposit,
        balance,
        Some(rate),
        opened_days_ago,
    )
}

// =========================================================================
// Outbox
// =========================================================================

pub fn dispatcher_config(max_retries: i32) -> DispatcherConfig {
    DispatcherConfig {
        batch_size: 20,
        max_retries,
        poll_interval: Duration::from_millis(10),
    }
}

pub fn dispatcher(store: &TestStore, broker: &InMemoryBroker, max_retries: i32) -> OutboxDispatcher {
    OutboxDispatcher::new(
        store.storage.clone(),
        OutboxPublisher::new(Arc::new(broker.clone())),
        dispatcher_config(max_retries),
    )
}

// =========================================================================
// Inbox
// =========================================================================

/// Fast retries for consumer tests
pub fn consumer_config(max_attempts: u32) -> ConsumerConfig {
    ConsumerConfig {
        queue: "account-service.client".to_string(),
        prefetch: 1,
        max_attempts,
        backoff_base: Duration::from_millis(1),
        max_jitter: Duration::ZERO,
    }
}

/// Inbound envelope body as an upstream producer would send it
pub fn client_envelope(event_id: Uuid, client_id: Uuid, correlation_id: Uuid, version: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "eventId": event_id,
        "occurredAt": Utc::now(),
        "payload": { "clientId": client_id },
        "meta": {
            "version": version,
            "source": "client-service",
            "correlationId": correlation_id,
            "causationId": Uuid::new_v4(),
        }
    }))
    .expect("envelope json")
}

pub fn delivery(routing_key: &str, body: Vec<u8>) -> InboundMessage {
    InboundMessage {
        delivery_tag: 1,
        message_id: None,
        routing_key: routing_key.to_string(),
        correlation_id: None,
        headers: HashMap::new(),
        body,
        redelivered: false,
    }
}

// =========================================================================
// Jobs
// =========================================================================

/// Queue that only records what was enqueued
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<AccrualJob>>,
}

impl RecordingQueue {
    pub fn jobs(&self) -> Vec<AccrualJob> {
        self.jobs.lock().expect("jobs lock").clone()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, job: AccrualJob) -> Result<(), JobError> {
        self.jobs.lock().expect("jobs lock").push(job);
        Ok(())
    }
}

/// Wait until `condition` holds or the timeout expires
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
