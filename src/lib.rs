//! bank_ledger Library
//!
//! Reliability core of the account ledger: transactional outbox, idempotent
//! inbox, optimistic concurrency on accounts and batched interest accrual.
//! Re-exports modules for integration testing and the binary.

pub mod aggregate;
pub mod api;
pub mod broker;
pub mod concurrency;
pub mod domain;
pub mod handlers;
pub mod inbox;
pub mod jobs;
pub mod outbox;
pub mod store;

pub mod config;
pub mod db;
mod error;

pub use config::Config;
pub use error::{AppError, AppResult, ErrorResponse};
pub use domain::{AccountEvent, Amount, AmountError, Balance, DomainError, OperationContext};
