//! Aggregate module
//!
//! Mutable, version-stamped aggregates. State is persisted as a row and every
//! write back is conditioned on the version that was read.

pub mod account;

pub use account::{Account, AccountStatus, AccountType};

use crate::concurrency::ConcurrencyToken;

/// Aggregate trait that all aggregates must implement
pub trait Aggregate {
    /// Get the aggregate type name (for storage and conflict reporting)
    fn aggregate_type() -> &'static str;

    /// Get the aggregate ID
    fn id(&self) -> uuid::Uuid;

    /// Get the version token read together with the state
    fn version(&self) -> ConcurrencyToken;
}
