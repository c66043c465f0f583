//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Business rule violations raised by the account aggregate.
///
/// These are returned to the caller as structured failures and are never
/// retried automatically anywhere in the core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Account {0} is closed")]
    AccountClosed(Uuid),

    #[error("Account {0} is frozen")]
    AccountFrozen(Uuid),

    #[error("Account {0} is already open")]
    AccountNotClosed(Uuid),

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Cannot transfer to the same account")]
    SameAccountTransfer,

    #[error("Account {account_id} still holds a balance of {balance}")]
    NonZeroBalance { account_id: Uuid, balance: Decimal },

    #[error("Interest rate is not applicable to {0} accounts")]
    InterestRateNotApplicable(String),

    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),
}

impl DomainError {
    pub fn insufficient_funds(required: Decimal, available: Decimal) -> Self {
        Self::InsufficientFunds { required, available }
    }

    pub fn currency_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::CurrencyMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Stable machine-readable code, used in HTTP bodies and dead-letter errors
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::AccountClosed(_) => "account_closed",
            Self::AccountFrozen(_) => "account_frozen",
            Self::AccountNotClosed(_) => "account_not_closed",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::SameAccountTransfer => "same_account_transfer",
            Self::NonZeroBalance { .. } => "non_zero_balance",
            Self::InterestRateNotApplicable(_) => "interest_rate_not_applicable",
            Self::BusinessRuleViolation(_) => "business_rule_violation",
        }
    }
}
