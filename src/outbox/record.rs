//! Outbox record
//!
//! One row per event awaiting (or done with) delivery. The payload is the
//! serialized envelope and is sent byte for byte.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{AccountEvent, EventEnvelope, OperationContext};

/// Appended to `last_error` when a record exhausts its retries
pub const POISON_MARKER: &str = "[poisoned: retries exhausted]";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    /// Event id of the envelope; globally unique
    pub id: Uuid,
    /// Event type name, drives routing
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: String,
    pub occurred_at: DateTime<Utc>,
    /// `None` while pending; set for both delivered and poisoned records
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub correlation_id: Uuid,
}

/// What a failed publication did to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still pending, picked up again next cycle
    WillRetry,
    /// Terminal; never selected again
    Poisoned,
}

impl OutboxRecord {
    /// Wrap an event in a fresh envelope and build its pending record
    pub fn from_event(
        event: &AccountEvent,
        context: &OperationContext,
    ) -> Result<Self, serde_json::Error> {
        let envelope = EventEnvelope::new(event, context);
        let payload = serde_json::to_string(&envelope)?;

        Ok(Self {
            id: envelope.event_id,
            event_type: event.event_type().to_string(),
            payload,
            occurred_at: envelope.occurred_at,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            correlation_id: envelope.meta.correlation_id,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    pub fn is_poisoned(&self) -> bool {
        self.processed_at.is_some()
            && self
                .last_error
                .as_deref()
                .is_some_and(|e| e.ends_with(POISON_MARKER))
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.processed_at = Some(now);
        self.last_error = None;
    }

    /// Count a failed attempt; poison the record once the failures exceed
    /// `max_retries`.
    pub fn record_failure(
        &mut self,
        error: &str,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.retry_count += 1;

        if self.retry_count > max_retries {
            self.processed_at = Some(now);
            self.last_error = Some(format!("{} {}", error, POISON_MARKER));
            FailureOutcome::Poisoned
        } else {
            self.last_error = Some(error.to_string());
            FailureOutcome::WillRetry
        }
    }

    /// Return a poisoned record to the pending state (operator replay)
    pub fn reset_for_replay(&mut self) {
        self.processed_at = None;
        self.retry_count = 0;
        self.last_error = None;
    }
}
