//! Scheduled Jobs
//!
//! Interest accrual runs, fanned out into independent batch jobs, and the
//! scheduler that triggers them periodically.

pub mod accrual;
pub mod queue;

pub use accrual::{plan_jobs, AccrualJob, AccrualOrchestrator, AccrualWorker, BatchOutcome, ScheduleReport};
pub use queue::{JobQueue, TokioJobQueue};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::concurrency::GuardError;
use crate::domain::DomainError;
use crate::store::StoreError;

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval between accrual runs (default: 1 day)
    pub accrual_interval: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            accrual_interval: Duration::from_secs(86_400),
        }
    }
}

/// Job Scheduler - triggers accrual runs on a fixed interval
pub struct JobScheduler {
    orchestrator: Arc<AccrualOrchestrator>,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    /// Create a new job scheduler
    pub fn new(orchestrator: Arc<AccrualOrchestrator>) -> Self {
        Self {
            orchestrator,
            config: JobSchedulerConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(orchestrator: Arc<AccrualOrchestrator>, config: JobSchedulerConfig) -> Self {
        Self { orchestrator, config }
    }

    /// Start the job scheduler in the background
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    /// Run the scheduler loop. The first run happens immediately; a rerun on
    /// the same date accrues nothing.
    async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.config.accrual_interval.as_secs(), "Job scheduler started");

        let mut accrual_interval = interval(self.config.accrual_interval);
        accrual_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = accrual_interval.tick() => {
                    if let Err(e) = self.run_accrual_once().await {
                        tracing::error!(error = %e, "Interest accrual scheduling failed");
                    }
                }
            }
        }

        tracing::info!("Job scheduler stopped");
    }

    /// Schedule one accrual run for today
    pub async fn run_accrual_once(&self) -> Result<ScheduleReport, JobError> {
        self.orchestrator.schedule(Utc::now().date_naive()).await
    }
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: uuid::Uuid },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Queue error: {0}")]
    Queue(String),
}

impl From<GuardError> for JobError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Store(e) => JobError::Store(e),
            GuardError::Domain(e) => JobError::Domain(e),
            GuardError::NotFound { entity, id } => JobError::NotFound { entity, id },
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
