//! Command definitions
//!
//! Commands represent intentions to change account state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::AccountType;
use crate::concurrency::ConcurrencyToken;

// =========================================================================
// Account lifecycle
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccountCommand {
    pub owner_id: Uuid,
    pub account_type: AccountType,
    /// ISO 4217 code
    pub currency: String,
    /// Annual percent, deposit accounts only
    pub interest_rate: Option<Decimal>,
}

impl OpenAccountCommand {
    pub fn new(owner_id: Uuid, account_type: AccountType, currency: impl Into<String>) -> Self {
        Self {
            owner_id,
            account_type,
            currency: currency.into(),
            interest_rate: None,
        }
    }

    pub fn with_interest_rate(mut self, rate: Decimal) -> Self {
        self.interest_rate = Some(rate);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseAccountCommand {
    pub account_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReopenAccountCommand {
    pub account_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeOwnerCommand {
    pub account_id: Uuid,
    pub new_owner_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeInterestRateCommand {
    pub account_id: Uuid,
    pub new_rate: Decimal,
}

// =========================================================================
// Money movement
// =========================================================================

/// Credit money to an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositCommand {
    pub account_id: Uuid,
    /// Amount (as string for precise decimal)
    pub amount: String,
    pub description: Option<String>,
}

impl DepositCommand {
    pub fn new(account_id: Uuid, amount: impl Into<String>) -> Self {
        Self {
            account_id,
            amount: amount.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Debit money from an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawCommand {
    pub account_id: Uuid,
    pub amount: String,
    pub description: Option<String>,
}

impl WithdrawCommand {
    pub fn new(account_id: Uuid, amount: impl Into<String>) -> Self {
        Self {
            account_id,
            amount: amount.into(),
            description: None,
        }
    }
}

/// Move money between two accounts of the same currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCommand {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: String,
    /// Optional memo
    pub memo: Option<String>,
}

impl TransferCommand {
    pub fn new(from_account_id: Uuid, to_account_id: Uuid, amount: impl Into<String>) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount: amount.into(),
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

// =========================================================================
// Results
// =========================================================================

/// Result of a successful account mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResult {
    pub account_id: Uuid,
    /// Id of the staged event
    pub event_id: Uuid,
    pub version: ConcurrencyToken,
}

/// Result of a successful deposit or withdrawal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneyResult {
    pub account_id: Uuid,
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub version: ConcurrencyToken,
}

/// Result of a successful transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: Uuid,
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: Decimal,
    pub status: String,
}
