//! Job queue seam
//!
//! The orchestrator only enqueues; where and when a job runs is up to the
//! queue. [`TokioJobQueue`] runs every job as its own task in this process.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::accrual::{AccrualJob, AccrualWorker};
use super::JobError;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: AccrualJob) -> Result<(), JobError>;
}

/// In-process queue: one task per job, each behind its own failure boundary
pub struct TokioJobQueue {
    worker: Arc<AccrualWorker>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TokioJobQueue {
    pub fn new(worker: Arc<AccrualWorker>, cancel: CancellationToken) -> Self {
        Self {
            worker,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Jobs still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting jobs and wait for the running ones
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[async_trait]
impl JobQueue for TokioJobQueue {
    async fn enqueue(&self, job: AccrualJob) -> Result<(), JobError> {
        if self.tracker.is_closed() {
            return Err(JobError::Queue("queue is draining".to_string()));
        }

        let worker = self.worker.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            match worker.run(&job, &cancel).await {
                Ok(_) => {}
                Err(JobError::Cancelled) => {
                    tracing::warn!(job_id = %job.job_id, page = job.page, "Accrual job cancelled");
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job.job_id,
                        run_id = %job.run_id,
                        page = job.page,
                        error = %e,
                        "Accrual job failed"
                    );
                }
            }
        });

        Ok(())
    }
}
