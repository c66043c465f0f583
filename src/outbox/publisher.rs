//! Outbox Publisher
//!
//! Turns one outbox record into one routed broker message. The stored payload
//! is sent unchanged; the envelope is only read for its tracing metadata.
//! Never retries: retry policy belongs to the dispatcher.

use serde::Deserialize;
use std::sync::Arc;

use crate::broker::{BrokerError, MessagePublisher, OutboundMessage, CONTENT_TYPE_JSON};
use crate::domain::EventMeta;

use super::record::OutboxRecord;
use super::routing::routing_key;

/// Publication failure of a single record
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Stored envelope is unreadable: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Just the part of the envelope routing needs
#[derive(Deserialize)]
struct RoutingView {
    meta: EventMeta,
}

#[derive(Clone)]
pub struct OutboxPublisher {
    broker: Arc<dyn MessagePublisher>,
}

impl OutboxPublisher {
    pub fn new(broker: Arc<dyn MessagePublisher>) -> Self {
        Self { broker }
    }

    /// Build the transport message for a record
    pub fn message_for(record: &OutboxRecord) -> Result<OutboundMessage, PublishError> {
        let view: RoutingView = serde_json::from_str(&record.payload)?;

        Ok(OutboundMessage {
            message_id: record.id,
            routing_key: routing_key(&record.event_type).to_string(),
            correlation_id: view.meta.correlation_id,
            causation_id: view.meta.causation_id,
            content_type: CONTENT_TYPE_JSON,
            persistent: true,
            body: record.payload.as_bytes().to_vec(),
        })
    }

    pub async fn publish(&self, record: &OutboxRecord) -> Result<(), PublishError> {
        let message = Self::message_for(record)?;
        self.broker.publish(message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountEvent, OperationContext};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_message_headers_from_envelope() {
        let context = OperationContext::new().with_causation_id(Uuid::new_v4());
        let event = AccountEvent::AccountReopened {
            account_id: Uuid::new_v4(),
            reopened_at: Utc::now(),
        };
        let record = OutboxRecord::from_event(&event, &context).unwrap();

        let message = OutboxPublisher::message_for(&record).unwrap();
        assert_eq!(message.message_id, record.id);
        assert_eq!(message.routing_key, "account.reopened");
        assert_eq!(message.correlation_id, context.correlation_id);
        assert_eq!(message.causation_id, context.causation_id);
        assert_eq!(message.content_type, "application/json");
        assert!(message.persistent);
        assert_eq!(message.body, record.payload.as_bytes());
    }

    #[test]
    fn test_unreadable_payload() {
        let event = AccountEvent::AccountReopened {
            account_id: Uuid::new_v4(),
            reopened_at: Utc::now(),
        };
        let mut record = OutboxRecord::from_event(&event, &OperationContext::new()).unwrap();
        record.payload = "not an envelope".to_string();

        assert!(matches!(
            OutboxPublisher::message_for(&record),
            Err(PublishError::Envelope(_))
        ));
    }
}
