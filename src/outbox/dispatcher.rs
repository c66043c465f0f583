//! Outbox Dispatcher
//!
//! Background polling loop. Each cycle claims up to `batch_size` pending
//! records in `occurred_at` order, publishes them one by one, and persists
//! the resulting delivery state of the whole batch in one transaction.
//!
//! If that final save fails, nothing of the cycle is persisted: the records
//! stay pending and are published again next cycle (at-least-once).

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::store::{IsolationLevel, StoreError, Storage};

use super::publisher::OutboxPublisher;
use super::record::FailureOutcome;
use super::routing::routing_key;

/// Result of one dispatcher cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub delivered: usize,
    /// Failed but still pending
    pub failed: usize,
    pub poisoned: usize,
}

impl DispatchReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

pub struct OutboxDispatcher {
    storage: Arc<dyn Storage>,
    publisher: OutboxPublisher,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(storage: Arc<dyn Storage>, publisher: OutboxPublisher, config: DispatcherConfig) -> Self {
        Self {
            storage,
            publisher,
            config,
        }
    }

    /// Start the dispatcher loop in the background
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    /// Poll until cancelled. Cycle failures are logged and retried next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Outbox dispatcher started"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_once(&cancel).await {
                        tracing::error!(error = %e, "Outbox dispatch cycle failed");
                    }
                }
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    /// Run a single cycle.
    ///
    /// Cancellation stops publishing the rest of the batch; records already
    /// handled in this cycle are still saved.
    pub async fn dispatch_once(&self, cancel: &CancellationToken) -> Result<DispatchReport, StoreError> {
        let mut tx = self.storage.begin(IsolationLevel::ReadCommitted).await?;
        let mut records = tx.claim_pending_outbox(self.config.batch_size).await?;

        let mut report = DispatchReport {
            claimed: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            tx.rollback().await?;
            return Ok(report);
        }

        let mut handled = 0;
        for record in records.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }
            handled += 1;

            match self.publisher.publish(record).await {
                Ok(()) => {
                    record.mark_delivered(Utc::now());
                    report.delivered += 1;
                    tracing::debug!(
                        outbox_id = %record.id,
                        routing_key = routing_key(&record.event_type),
                        "Outbox record published"
                    );
                }
                Err(e) => {
                    let error = e.to_string();
                    match record.record_failure(&error, self.config.max_retries, Utc::now()) {
                        FailureOutcome::WillRetry => {
                            report.failed += 1;
                            tracing::warn!(
                                outbox_id = %record.id,
                                retry_count = record.retry_count,
                                error = %error,
                                "Outbox publish failed, will retry"
                            );
                        }
                        FailureOutcome::Poisoned => {
                            report.poisoned += 1;
                            tracing::error!(
                                outbox_id = %record.id,
                                event_type = %record.event_type,
                                retry_count = record.retry_count,
                                error = %error,
                                "Outbox record poisoned"
                            );
                        }
                    }
                }
            }
        }

        tx.save_outbox(&records[..handled]).await?;
        tx.commit().await?;

        if report.delivered + report.failed + report.poisoned > 0 {
            tracing::info!(
                claimed = report.claimed,
                delivered = report.delivered,
                failed = report.failed,
                poisoned = report.poisoned,
                "Outbox batch saved"
            );
        }

        Ok(report)
    }
}
