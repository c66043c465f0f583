//! Inbox records
//!
//! Processed-message markers and the dead-letter ledger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Marker proving that `handler_name` applied message `message_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxRecord {
    pub message_id: Uuid,
    pub handler_name: String,
    pub processed_at: DateTime<Utc>,
}

impl InboxRecord {
    pub fn new(message_id: Uuid, handler_name: impl Into<String>) -> Self {
        Self {
            message_id,
            handler_name: handler_name.into(),
            processed_at: Utc::now(),
        }
    }
}

/// A message that will not be processed automatically any more
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxDeadLetterRecord {
    pub message_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub handler_name: String,
    /// Raw body as received (lossy UTF-8 for binary garbage)
    pub payload: String,
    pub error: String,
}

impl InboxDeadLetterRecord {
    pub fn new(
        message_id: Uuid,
        handler_name: impl Into<String>,
        body: &[u8],
        error: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            received_at: Utc::now(),
            handler_name: handler_name.into(),
            payload: String::from_utf8_lossy(body).into_owned(),
            error: error.into(),
        }
    }
}
