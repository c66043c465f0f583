//! PostgreSQL storage engine
//!
//! Raw SQL over a `PgPool`. Relies on the database for row locking
//! (`FOR UPDATE`, `FOR UPDATE SKIP LOCKED`), uniqueness
//! (`ON CONFLICT DO NOTHING`) and isolation (`SET TRANSACTION ISOLATION LEVEL`).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::aggregate::{Account, Aggregate};
use crate::concurrency::ConcurrencyToken;
use crate::domain::{Balance, CurrencyCode};
use crate::inbox::record::{InboxDeadLetterRecord, InboxRecord};
use crate::outbox::record::{OutboxRecord, POISON_MARKER};

use super::{IsolationLevel, StoreError, StoreTx, Storage};

const ACCOUNT_COLUMNS: &str = "id, owner_id, account_type, currency, balance, interest_rate, \
     status, frozen, opened_at, closed_at, last_accrual_date, version";

const OUTBOX_COLUMNS: &str =
    "id, type, payload, occurred_at, processed_at, retry_count, error, correlation_id";

const ELIGIBLE_FILTER: &str = "account_type = 'deposit' AND status = 'open' AND balance > 0";

// =========================================================================
// Row mapping
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    owner_id: Uuid,
    account_type: String,
    currency: String,
    balance: Decimal,
    interest_rate: Option<Decimal>,
    status: String,
    frozen: bool,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    last_accrual_date: Option<NaiveDate>,
    version: i64,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let corrupt = |e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("account {}: {}", row.id, e))
        };

        Ok(Account {
            id: row.id,
            owner_id: row.owner_id,
            account_type: row.account_type.parse().map_err(|e| corrupt(&e))?,
            currency: CurrencyCode::new(&row.currency).map_err(|e| corrupt(&e))?,
            balance: Balance::new(row.balance).map_err(|e| corrupt(&e))?,
            interest_rate: row.interest_rate,
            status: row.status.parse().map_err(|e| corrupt(&e))?,
            frozen: row.frozen,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            last_accrual_date: row.last_accrual_date,
            version: ConcurrencyToken::from_raw(row.version),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    event_type: String,
    payload: String,
    occurred_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    error: Option<String>,
    correlation_id: Uuid,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            processed_at: row.processed_at,
            retry_count: row.retry_count,
            last_error: row.error,
            correlation_id: row.correlation_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    message_id: Uuid,
    received_at: DateTime<Utc>,
    handler: String,
    payload: String,
    error: String,
}

impl From<DeadLetterRow> for InboxDeadLetterRecord {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            message_id: row.message_id,
            received_at: row.received_at,
            handler_name: row.handler,
            payload: row.payload,
            error: row.error,
        }
    }
}

// =========================================================================
// Storage
// =========================================================================

/// PostgreSQL-backed storage
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&sql).execute(&mut *tx).await?;

        Ok(Box::new(PgTx { tx }))
    }

    async fn inbox_contains(&self, message_id: Uuid, handler: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM inbox_consumed WHERE message_id = $1 AND handler = $2
            )
            "#,
        )
        .bind(message_id)
        .bind(handler)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn dead_letter(&self, record: &InboxDeadLetterRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox_dead_letters (message_id, received_at, handler, payload, error)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(record.message_id)
        .bind(record.received_at)
        .bind(&record.handler_name)
        .bind(&record.payload)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<InboxDeadLetterRecord>, StoreError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT message_id, received_at, handler, payload, error
            FROM inbox_dead_letters
            ORDER BY received_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn outbox_record(&self, id: Uuid) -> Result<Option<OutboxRecord>, StoreError> {
        let sql = format!("SELECT {} FROM outbox_messages WHERE id = $1", OUTBOX_COLUMNS);
        let row: Option<OutboxRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn poisoned_outbox(&self, limit: i64) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM outbox_messages
            WHERE processed_at IS NOT NULL AND error LIKE '%' || $1
            ORDER BY occurred_at
            LIMIT $2
            "#,
            OUTBOX_COLUMNS
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(POISON_MARKER)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn replay_outbox(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = NULL, retry_count = 0, error = NULL
            WHERE id = $1 AND processed_at IS NOT NULL AND error LIKE '%' || $2
            "#,
        )
        .bind(id)
        .bind(POISON_MARKER)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_accrual_eligible(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM accounts WHERE {}", ELIGIBLE_FILTER);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn accrual_eligible_page(&self, page: i64, page_size: i64) -> Result<Vec<Uuid>, StoreError> {
        let sql = format!(
            "SELECT id FROM accounts WHERE {} ORDER BY id LIMIT $1 OFFSET $2",
            ELIGIBLE_FILTER
        );
        let ids: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(page_size)
            .bind(page * page_size)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Account::try_from).transpose()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =========================================================================
// Transaction
// =========================================================================

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn fetch_account(&mut self, id: Uuid, lock: bool) -> Result<Option<Account>, StoreError> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE id = $1{}",
            ACCOUNT_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Account::try_from).transpose()
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn load_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        self.fetch_account(id, false).await
    }

    async fn load_account_for_update(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        self.fetch_account(id, true).await
    }

    async fn accounts_by_owner(&mut self, owner_id: Uuid) -> Result<Vec<Account>, StoreError> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE owner_id = $1 ORDER BY id FOR UPDATE",
            ACCOUNT_COLUMNS
        );
        let rows: Vec<AccountRow> = sqlx::query_as(&sql)
            .bind(owner_id)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter().map(Account::try_from).collect()
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (
                id, owner_id, account_type, currency, balance, interest_rate,
                status, frozen, opened_at, closed_at, last_accrual_date, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account.id())
        .bind(account.owner_id())
        .bind(account.account_type().as_str())
        .bind(account.currency().as_str())
        .bind(account.balance().value())
        .bind(account.interest_rate())
        .bind(account.status().as_str())
        .bind(account.is_frozen())
        .bind(account.opened_at())
        .bind(account.closed_at())
        .bind(account.last_accrual_date())
        .bind(account.version().value())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                entity: Account::aggregate_type(),
                id: account.id(),
            });
        }
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> Result<ConcurrencyToken, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET owner_id = $2,
                balance = $3,
                interest_rate = $4,
                status = $5,
                frozen = $6,
                closed_at = $7,
                last_accrual_date = $8,
                version = version + 1
            WHERE id = $1 AND version = $9
            "#,
        )
        .bind(account.id())
        .bind(account.owner_id())
        .bind(account.balance().value())
        .bind(account.interest_rate())
        .bind(account.status().as_str())
        .bind(account.is_frozen())
        .bind(account.closed_at())
        .bind(account.last_accrual_date())
        .bind(account.version().value())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                entity: Account::aggregate_type(),
                id: account.id(),
            });
        }
        Ok(account.version().next())
    }

    async fn add_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, type, payload, occurred_at, processed_at, retry_count, error, correlation_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.occurred_at)
        .bind(record.processed_at)
        .bind(record.retry_count)
        .bind(&record.last_error)
        .bind(record.correlation_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn claim_pending_outbox(&mut self, limit: i64) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM outbox_messages
            WHERE processed_at IS NULL
            ORDER BY occurred_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
            OUTBOX_COLUMNS
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_outbox(&mut self, records: &[OutboxRecord]) -> Result<(), StoreError> {
        for record in records {
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET processed_at = $2, retry_count = $3, error = $4
                WHERE id = $1
                "#,
            )
            .bind(record.id)
            .bind(record.processed_at)
            .bind(record.retry_count)
            .bind(&record.last_error)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn inbox_contains(&mut self, message_id: Uuid, handler: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM inbox_consumed WHERE message_id = $1 AND handler = $2
            )
            "#,
        )
        .bind(message_id)
        .bind(handler)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn record_inbox(&mut self, record: &InboxRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox_consumed (message_id, handler, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, handler) DO NOTHING
            "#,
        )
        .bind(record.message_id)
        .bind(&record.handler_name)
        .bind(record.processed_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateMessage {
                message_id: record.message_id,
                handler: record.handler_name.clone(),
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
