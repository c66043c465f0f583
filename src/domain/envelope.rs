//! Event Envelope
//!
//! Outer wrapper around every domain event that crosses the process boundary.
//! Wire format:
//!
//! ```json
//! {
//!   "eventId": "…uuid…",
//!   "occurredAt": "2026-01-01T00:00:00Z",
//!   "payload": { … },
//!   "meta": { "version": "v1", "source": "account-service",
//!             "correlationId": "…uuid…", "causationId": "…uuid…" }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OperationContext;

/// Envelope schema version produced and accepted by this service
pub const SCHEMA_VERSION: &str = "v1";

/// Source system name stamped on every produced envelope
pub const SOURCE_SYSTEM: &str = "account-service";

/// Tracing and versioning metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(rename = "version")]
    pub schema_version: String,
    #[serde(rename = "source")]
    pub source_system: String,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

/// Envelope around a domain event body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: T,
    pub meta: EventMeta,
}

impl<T> EventEnvelope<T> {
    /// Wrap a payload produced by this service within the given causal context
    pub fn new(payload: T, context: &OperationContext) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            payload,
            meta: EventMeta {
                schema_version: SCHEMA_VERSION.to_string(),
                source_system: SOURCE_SYSTEM.to_string(),
                correlation_id: context.correlation_id,
                causation_id: context.causation_id,
            },
        }
    }

    /// Causal context for work triggered by this envelope
    pub fn downstream_context(&self) -> OperationContext {
        OperationContext::caused_by(self.meta.correlation_id, self.event_id)
    }
}

/// Reasons an inbound body cannot be turned into an envelope.
///
/// All of them are permanent: the same bytes will fail the same way on every
/// redelivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope has no valid eventId")]
    MissingEventId,

    #[error("Unsupported schema version: {0}")]
    UnsupportedVersion(String),
}

/// Decode an inbound message body.
///
/// The event id is extracted before full validation so that a structurally
/// broken envelope can still be dead-lettered under its own id.
pub fn decode_inbound(body: &[u8]) -> Result<EventEnvelope<serde_json::Value>, EnvelopeError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| EnvelopeError::Malformed("body is not a JSON object".to_string()))?;

    let has_event_id = object
        .get("eventId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .is_some();
    if !has_event_id {
        return Err(EnvelopeError::MissingEventId);
    }

    let version = object
        .get("meta")
        .and_then(|m| m.get("version"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| EnvelopeError::Malformed("meta.version is missing".to_string()))?;
    if version != SCHEMA_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(version.to_string()));
    }

    serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Best-effort event id lookup for bodies that failed to decode
pub fn peek_event_id(body: &[u8]) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("eventId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
