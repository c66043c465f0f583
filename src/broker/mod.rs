//! Broker module
//!
//! Transport seam between the reliability core and the message broker.
//! The core only needs a topic exchange with persistent, individually
//! acknowledged deliveries; [`InMemoryBroker`] provides that in-process and
//! `AmqpBroker` (feature `amqp`) over RabbitMQ.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::{InMemoryBroker, MemorySource};

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

/// Transport header carrying `meta.causationId`
pub const CAUSATION_ID_HEADER: &str = "x-causation-id";

/// Content type of every produced message
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Broker errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// A message ready to be handed to the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub routing_key: String,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
    pub content_type: &'static str,
    /// Survive broker restarts (AMQP delivery mode 2)
    pub persistent: bool,
    pub body: Vec<u8>,
}

/// A delivery taken from a queue, awaiting ack or nack
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Final decision for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with it (processed, duplicate or dead-lettered)
    Ack,
    /// Put it back for another delivery
    Requeue,
}

/// Publishing side of the transport
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;
}

/// Consuming side of the transport (one queue)
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next delivery; `None` once the source is closed
    async fn receive(&self) -> Result<Option<InboundMessage>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Ack => self.ack(delivery_tag).await,
            Disposition::Requeue => self.nack(delivery_tag, true).await,
        }
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && match_words(rest, key_rest),
            None => false,
        },
    }
}
