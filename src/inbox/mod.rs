//! Idempotent inbox
//!
//! Inbound events are applied at most once per `(message id, handler)`: the
//! consumer records a marker in the same transaction as the effect. Messages
//! that can never be processed land in the dead-letter ledger.

pub mod consumer;
pub mod handlers;
pub mod record;
pub mod retry;

pub use consumer::{DeadLetterReason, InboundConsumer, ProcessOutcome};
pub use handlers::{ClientStatusHandler, HandlerError, HandlerRegistry, MessageHandler};
pub use record::{InboxDeadLetterRecord, InboxRecord};
pub use retry::{RetryError, RetryPolicy};
