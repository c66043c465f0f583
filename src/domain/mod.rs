//! Domain module
//!
//! Core domain types and business logic.

pub mod amount;
pub mod context;
pub mod envelope;
pub mod error;
pub mod events;

pub use amount::{Amount, AmountError, Balance, CurrencyCode};
pub use context::OperationContext;
pub use envelope::{EnvelopeError, EventEnvelope, EventMeta, SCHEMA_VERSION, SOURCE_SYSTEM};
pub use error::DomainError;
pub use events::{AccountEvent, ClientStatusChanged};
