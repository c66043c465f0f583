//! Inbound Consumer
//!
//! Long-running subscriber. A delivery moves through
//! received → envelope validated → pre-checked → processed (re-checked,
//! applied, marked, committed) → acknowledged, or leaves early through the
//! dead-letter ledger. Whatever happens, each delivery is settled exactly once:
//! acked when done, or nacked with requeue when the outcome is unknown
//! (cancellation, unreachable store).

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Disposition, InboundMessage, MessageSource};
use crate::config::ConsumerConfig;
use crate::domain::envelope::{decode_inbound, peek_event_id, EnvelopeError};
use crate::domain::EventEnvelope;
use crate::store::{StoreError, Storage};

use super::handlers::{HandlerError, HandlerRegistry, MessageHandler};
use super::record::{InboxDeadLetterRecord, InboxRecord};
use super::retry::{RetryError, RetryPolicy};

/// Pause after a broker receive error
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    Malformed,
    UnsupportedVersion,
    Rejected,
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Malformed => "malformed_envelope",
            DeadLetterReason::UnsupportedVersion => "unsupported_schema_version",
            DeadLetterReason::Rejected => "permanent_failure",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// How one delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Effect applied and committed
    Processed,
    /// Already applied earlier
    Duplicate,
    DeadLettered(DeadLetterReason),
    /// No handler for the routing key
    Skipped,
    /// Outcome unknown; hand it back to the broker
    Requeue,
}

impl ProcessOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessOutcome::Requeue => Disposition::Requeue,
            _ => Disposition::Ack,
        }
    }
}

/// Result of one transactional attempt
enum Applied {
    Committed,
    AlreadyProcessed,
}

pub struct InboundConsumer {
    storage: Arc<dyn Storage>,
    source: Arc<dyn MessageSource>,
    handlers: HandlerRegistry,
    retry: RetryPolicy,
}

impl InboundConsumer {
    pub fn new(
        storage: Arc<dyn Storage>,
        source: Arc<dyn MessageSource>,
        handlers: HandlerRegistry,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            storage,
            source,
            handlers,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start the consumer loop in the background
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    /// Consume until cancelled or the source closes
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(routing_keys = ?self.handlers.routing_keys(), "Inbound consumer started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.source.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    let outcome = self.process(&message, &cancel).await;
                    self.settle(&message, outcome).await;
                }
                Ok(None) => {
                    tracing::info!("Message source closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive message");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!("Inbound consumer stopped");
    }

    async fn settle(&self, message: &InboundMessage, outcome: ProcessOutcome) {
        if let Err(e) = self
            .source
            .settle(message.delivery_tag, outcome.disposition())
            .await
        {
            tracing::error!(
                error = %e,
                delivery_tag = message.delivery_tag,
                outcome = ?outcome,
                "Failed to settle delivery"
            );
        }
    }

    /// Decide the fate of one delivery. Does not ack or nack.
    pub async fn process(&self, message: &InboundMessage, cancel: &CancellationToken) -> ProcessOutcome {
        let Some(handler) = self.handlers.get(&message.routing_key) else {
            tracing::debug!(routing_key = %message.routing_key, "No handler, skipping");
            return ProcessOutcome::Skipped;
        };

        let envelope = match decode_inbound(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = match e {
                    EnvelopeError::UnsupportedVersion(_) => DeadLetterReason::UnsupportedVersion,
                    _ => DeadLetterReason::Malformed,
                };
                let message_id = fallback_message_id(message);
                return self
                    .dead_letter(message, message_id, handler.name(), reason, &e.to_string())
                    .await;
            }
        };

        let message_id = envelope.event_id;
        match self.storage.inbox_contains(message_id, handler.name()).await {
            Ok(true) => {
                tracing::debug!(message_id = %message_id, handler = handler.name(), "Duplicate delivery");
                return ProcessOutcome::Duplicate;
            }
            Ok(false) => {}
            // The in-transaction check still guards the effect
            Err(e) => tracing::warn!(error = %e, "Inbox pre-check failed"),
        }

        let result = self
            .retry
            .run(cancel, |attempt| {
                let handler = handler.clone();
                let envelope = &envelope;
                async move { self.apply_once(handler.as_ref(), envelope, attempt).await }
            })
            .await;

        match result {
            Ok(Applied::Committed) => {
                tracing::info!(
                    message_id = %message_id,
                    handler = handler.name(),
                    correlation_id = %envelope.meta.correlation_id,
                    "Inbound message processed"
                );
                ProcessOutcome::Processed
            }
            Ok(Applied::AlreadyProcessed) => ProcessOutcome::Duplicate,
            Err(RetryError::Cancelled) => {
                tracing::warn!(message_id = %message_id, "Processing cancelled, requeueing");
                ProcessOutcome::Requeue
            }
            Err(RetryError::Permanent(e)) => {
                self.dead_letter(message, message_id, handler.name(), DeadLetterReason::Rejected, &e.to_string())
                    .await
            }
            Err(e @ RetryError::Exhausted { .. }) => {
                self.dead_letter(
                    message,
                    message_id,
                    handler.name(),
                    DeadLetterReason::RetriesExhausted,
                    &e.to_string(),
                )
                .await
            }
        }
    }

    /// One attempt: re-check, apply, mark, commit; rolled back on any error
    async fn apply_once(
        &self,
        handler: &dyn MessageHandler,
        envelope: &EventEnvelope<serde_json::Value>,
        attempt: u32,
    ) -> Result<Applied, HandlerError> {
        let message_id = envelope.event_id;
        let mut tx = self.storage.begin(handler.isolation()).await?;

        if tx.inbox_contains(message_id, handler.name()).await? {
            tx.rollback().await?;
            return Ok(Applied::AlreadyProcessed);
        }

        handler.handle(tx.as_mut(), envelope).await?;

        match tx.record_inbox(&InboxRecord::new(message_id, handler.name())).await {
            Ok(()) => {}
            Err(StoreError::DuplicateMessage { .. }) => return Ok(Applied::AlreadyProcessed),
            Err(e) => return Err(e.into()),
        }

        match tx.commit().await {
            Ok(()) => {
                tracing::debug!(message_id = %message_id, attempt = attempt, "Inbox marker committed");
                Ok(Applied::Committed)
            }
            // A concurrent consumer committed the same message first
            Err(StoreError::DuplicateMessage { .. }) => Ok(Applied::AlreadyProcessed),
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        message_id: Uuid,
        handler: &str,
        reason: DeadLetterReason,
        error: &str,
    ) -> ProcessOutcome {
        let record = InboxDeadLetterRecord::new(
            message_id,
            handler,
            &message.body,
            format!("{}: {}", reason.as_str(), error),
        );

        match self.storage.dead_letter(&record).await {
            Ok(inserted) => {
                tracing::warn!(
                    message_id = %message_id,
                    handler = handler,
                    reason = reason.as_str(),
                    error = %error,
                    already_recorded = !inserted,
                    "Message dead-lettered"
                );
                ProcessOutcome::DeadLettered(reason)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    message_id = %message_id,
                    "Failed to record dead letter, requeueing"
                );
                ProcessOutcome::Requeue
            }
        }
    }
}

/// Id to file a broken message under: its own eventId if readable, then the
/// transport MessageId, else a fresh id.
fn fallback_message_id(message: &InboundMessage) -> Uuid {
    peek_event_id(&message.body)
        .or_else(|| {
            message
                .message_id
                .as_deref()
                .and_then(|id| Uuid::parse_str(id).ok())
        })
        .unwrap_or_else(Uuid::new_v4)
}
