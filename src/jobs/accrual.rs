//! Interest accrual batches
//!
//! The orchestrator splits the eligible population (deposit, open, positive
//! balance) into fixed-size pages and enqueues one job per page. A worker
//! job accrues its page in a single transaction: every account of the page
//! is booked, or none is.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::concurrency::{self, GuardError, ReadMode};
use crate::config::AccrualConfig;
use crate::domain::{AccountEvent, OperationContext};
use crate::outbox;
use crate::store::{IsolationLevel, Storage};

use super::queue::JobQueue;
use super::JobError;

/// One page of an accrual run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualJob {
    pub job_id: Uuid,
    pub run_id: Uuid,
    /// 0-based page over the eligible accounts ordered by id
    pub page: i64,
    pub batch_size: i64,
    /// Interest is accrued up to and including this date
    pub as_of: NaiveDate,
    pub correlation_id: Uuid,
}

impl AccrualJob {
    fn context(&self) -> OperationContext {
        OperationContext::caused_by(self.correlation_id, self.job_id)
    }
}

/// Number of pages needed for `total` items
pub fn plan_jobs(total: i64, batch_size: i64) -> i64 {
    if total <= 0 || batch_size <= 0 {
        return 0;
    }
    (total + batch_size - 1) / batch_size
}

/// What the orchestrator scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub run_id: Uuid,
    pub eligible: i64,
    pub jobs: i64,
}

/// Schedules accrual runs
pub struct AccrualOrchestrator {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn JobQueue>,
    config: AccrualConfig,
}

impl AccrualOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, queue: Arc<dyn JobQueue>, config: AccrualConfig) -> Self {
        Self {
            storage,
            queue,
            config,
        }
    }

    /// Count the eligible accounts and enqueue `ceil(total / batch_size)` jobs
    pub async fn schedule(&self, as_of: NaiveDate) -> Result<ScheduleReport, JobError> {
        let eligible = self.storage.count_accrual_eligible().await?;
        let jobs = plan_jobs(eligible, self.config.batch_size);
        let run_id = Uuid::new_v4();

        for page in 0..jobs {
            self.queue
                .enqueue(AccrualJob {
                    job_id: Uuid::new_v4(),
                    run_id,
                    page,
                    batch_size: self.config.batch_size,
                    as_of,
                    correlation_id: run_id,
                })
                .await?;
        }

        tracing::info!(
            run_id = %run_id,
            as_of = %as_of,
            eligible = eligible,
            jobs = jobs,
            batch_size = self.config.batch_size,
            "Interest accrual scheduled"
        );

        Ok(ScheduleReport {
            run_id,
            eligible,
            jobs,
        })
    }
}

/// Result of one committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub job_id: Uuid,
    pub page: i64,
    /// Accounts examined
    pub processed: usize,
    /// Accounts that received interest
    pub accrued: usize,
    /// Accounts whose interest could not be booked
    pub skipped: usize,
    pub total_interest: Decimal,
}

/// Runs accrual jobs
pub struct AccrualWorker {
    storage: Arc<dyn Storage>,
}

impl AccrualWorker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Accrue one page in one transaction.
    ///
    /// An account whose interest breaks a business rule is logged and skipped
    /// with its accrual date untouched. Cancellation rolls back the whole
    /// batch. Storage failures also roll back and are returned to the caller;
    /// retrying the job is safe because an account is only accrued for days
    /// not yet booked.
    pub async fn run(&self, job: &AccrualJob, cancel: &CancellationToken) -> Result<BatchOutcome, JobError> {
        let ids = self
            .storage
            .accrual_eligible_page(job.page, job.batch_size)
            .await?;
        let context = job.context();

        let mut outcome = BatchOutcome {
            job_id: job.job_id,
            page: job.page,
            processed: 0,
            accrued: 0,
            skipped: 0,
            total_interest: Decimal::ZERO,
        };

        let mut tx = self.storage.begin(IsolationLevel::ReadCommitted).await?;

        for id in ids {
            if cancel.is_cancelled() {
                tx.rollback().await?;
                tracing::warn!(job_id = %job.job_id, page = job.page, "Accrual batch cancelled, rolled back");
                return Err(JobError::Cancelled);
            }

            let mut account = match concurrency::load(tx.as_mut(), id, ReadMode::Locked).await {
                Ok(account) => account,
                Err(GuardError::NotFound { .. }) => {
                    tracing::warn!(account_id = %id, "Account vanished before accrual");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            outcome.processed += 1;

            let event = match account.accrue_interest(job.as_of, job.run_id) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(account_id = %id, error = %e, "Interest not accrued, account skipped");
                    outcome.skipped += 1;
                    continue;
                }
            };

            concurrency::write(tx.as_mut(), &mut account).await?;
            outbox::stage(tx.as_mut(), &event, &context).await?;

            if let AccountEvent::InterestAccrued { amount, .. } = &event {
                outcome.total_interest += *amount;
            }
            outcome.accrued += 1;
        }

        if cancel.is_cancelled() {
            tx.rollback().await?;
            return Err(JobError::Cancelled);
        }
        tx.commit().await?;

        tracing::info!(
            job_id = %job.job_id,
            run_id = %job.run_id,
            page = job.page,
            processed = outcome.processed,
            accrued = outcome.accrued,
            skipped = outcome.skipped,
            total_interest = %outcome.total_interest,
            "Accrual batch committed"
        );

        Ok(outcome)
    }
}
