//! Command Handlers module
//!
//! Command handlers that orchestrate account mutations. Each one opens a
//! storage transaction, applies the change through the concurrency guard,
//! stages the resulting events in the outbox and commits.

mod account_handler;
mod commands;
mod money_handler;
mod transfer_handler;

pub use account_handler::AccountHandler;
pub use commands::*;
pub use money_handler::MoneyHandler;
pub use transfer_handler::TransferHandler;
