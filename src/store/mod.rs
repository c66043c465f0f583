//! Storage module
//!
//! Transactional storage seam shared by command handlers, the outbox
//! dispatcher, the inbound consumer and the accrual worker. Two engines:
//! [`PgStorage`] for production and [`MemoryStorage`] for tests and local runs.
//!
//! A [`StoreTx`] dropped without `commit` is rolled back.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::Account;
use crate::concurrency::ConcurrencyToken;
use crate::inbox::record::{InboxDeadLetterRecord, InboxRecord};
use crate::outbox::record::OutboxRecord;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    /// Required when an invariant spans several rows (transfers)
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Conditional write matched no row: somebody else wrote first
    #[error("Concurrent modification of {entity} {id}")]
    Conflict { entity: &'static str, id: Uuid },

    /// Transaction aborted by the database (serialization failure, deadlock)
    #[error("Transaction aborted: {0}")]
    SerializationFailure(String),

    #[error("Message {message_id} already processed by {handler}")]
    DuplicateMessage { message_id: Uuid, handler: String },

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: Uuid },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored data: {0}")]
    Corrupt(String),
}

/// PostgreSQL SQLSTATE codes the engines care about
pub(crate) mod sqlstate {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let serialization = match &err {
            sqlx::Error::Database(db) => matches!(
                db.code().as_deref(),
                Some(sqlstate::SERIALIZATION_FAILURE) | Some(sqlstate::DEADLOCK_DETECTED)
            )
            .then(|| db.message().to_string()),
            _ => None,
        };

        if let Some(message) = serialization {
            return StoreError::SerializationFailure(message);
        }

        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

impl StoreError {
    /// Worth retrying the whole unit of work
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::SerializationFailure(_) | StoreError::Unavailable(_)
        )
    }

    /// Lost a write-write race
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::SerializationFailure(_)
        )
    }
}

/// Pool-level access: opens transactions and runs single-statement queries
#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Cheap idempotency pre-check outside any transaction
    async fn inbox_contains(&self, message_id: Uuid, handler: &str) -> Result<bool, StoreError>;

    /// Record a dead letter; `false` if one already exists for the message
    async fn dead_letter(&self, record: &InboxDeadLetterRecord) -> Result<bool, StoreError>;

    async fn dead_letters(&self, limit: i64) -> Result<Vec<InboxDeadLetterRecord>, StoreError>;

    async fn outbox_record(&self, id: Uuid) -> Result<Option<OutboxRecord>, StoreError>;

    async fn poisoned_outbox(&self, limit: i64) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Return a poisoned record to pending; `false` if it is not poisoned
    async fn replay_outbox(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Deposit, open, positive balance
    async fn count_accrual_eligible(&self) -> Result<i64, StoreError>;

    /// Ids of the eligible accounts on a 0-based page, ordered by id
    async fn accrual_eligible_page(&self, page: i64, page_size: i64) -> Result<Vec<Uuid>, StoreError>;

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// One storage transaction
#[async_trait]
pub trait StoreTx: Send {
    async fn load_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Load and row-lock until commit/rollback
    async fn load_account_for_update(&mut self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Row-locked accounts of one owner, ordered by id
    async fn accounts_by_owner(&mut self, owner_id: Uuid) -> Result<Vec<Account>, StoreError>;

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError>;

    /// Write the account if its stored token still equals `account.version()`.
    ///
    /// Returns the new token, or [`StoreError::Conflict`] when no row matched.
    async fn update_account(&mut self, account: &Account) -> Result<ConcurrencyToken, StoreError>;

    /// Stage an outbox record as part of this transaction
    async fn add_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError>;

    /// Pending records in `occurred_at` order, skipping those claimed by
    /// other open transactions
    async fn claim_pending_outbox(&mut self, limit: i64) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Persist the dispatcher-owned columns of the given records
    async fn save_outbox(&mut self, records: &[OutboxRecord]) -> Result<(), StoreError>;

    async fn inbox_contains(&mut self, message_id: Uuid, handler: &str) -> Result<bool, StoreError>;

    /// Insert the processed marker; [`StoreError::DuplicateMessage`] if it exists
    async fn record_inbox(&mut self, record: &InboxRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
