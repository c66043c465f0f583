//! Domain Events
//!
//! Facts published by the account service. Each variant serializes to the
//! `payload` object of an [`EventEnvelope`](super::EventEnvelope); the variant
//! name is stored separately as the outbox record type and drives routing.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account-related events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum AccountEvent {
    AccountOpened {
        account_id: Uuid,
        owner_id: Uuid,
        account_type: String,
        currency: String,
        interest_rate: Option<Decimal>,
        opened_at: DateTime<Utc>,
    },

    /// Balance increased by a deposit or by the credit leg of a transfer
    MoneyCredited {
        account_id: Uuid,
        transaction_id: Uuid,
        amount: Decimal,
        currency: String,
        balance_after: Decimal,
        description: Option<String>,
        credited_at: DateTime<Utc>,
    },

    /// Balance decreased by a withdrawal or by the debit leg of a transfer
    MoneyDebited {
        account_id: Uuid,
        transaction_id: Uuid,
        amount: Decimal,
        currency: String,
        balance_after: Decimal,
        description: Option<String>,
        debited_at: DateTime<Utc>,
    },

    TransferCompleted {
        transfer_id: Uuid,
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: Decimal,
        currency: String,
        completed_at: DateTime<Utc>,
    },

    InterestAccrued {
        account_id: Uuid,
        run_id: Uuid,
        amount: Decimal,
        currency: String,
        balance_after: Decimal,
        period_from: NaiveDate,
        period_to: NaiveDate,
    },

    AccountClosed {
        account_id: Uuid,
        closed_at: DateTime<Utc>,
    },

    AccountReopened {
        account_id: Uuid,
        reopened_at: DateTime<Utc>,
    },

    OwnerChanged {
        account_id: Uuid,
        previous_owner_id: Uuid,
        new_owner_id: Uuid,
        changed_at: DateTime<Utc>,
    },

    InterestRateChanged {
        account_id: Uuid,
        previous_rate: Option<Decimal>,
        new_rate: Decimal,
        changed_at: DateTime<Utc>,
    },

    /// Account blocked because its owner was blocked upstream
    AccountFrozen {
        account_id: Uuid,
        client_id: Uuid,
        frozen_at: DateTime<Utc>,
    },

    AccountUnfrozen {
        account_id: Uuid,
        client_id: Uuid,
        unfrozen_at: DateTime<Utc>,
    },
}

impl AccountEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened { .. } => "AccountOpened",
            AccountEvent::MoneyCredited { .. } => "MoneyCredited",
            AccountEvent::MoneyDebited { .. } => "MoneyDebited",
            AccountEvent::TransferCompleted { .. } => "TransferCompleted",
            AccountEvent::InterestAccrued { .. } => "InterestAccrued",
            AccountEvent::AccountClosed { .. } => "AccountClosed",
            AccountEvent::AccountReopened { .. } => "AccountReopened",
            AccountEvent::OwnerChanged { .. } => "OwnerChanged",
            AccountEvent::InterestRateChanged { .. } => "InterestRateChanged",
            AccountEvent::AccountFrozen { .. } => "AccountFrozen",
            AccountEvent::AccountUnfrozen { .. } => "AccountUnfrozen",
        }
    }

    /// Get the aggregate this event relates to.
    ///
    /// A completed transfer is attributed to its source account.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            AccountEvent::AccountOpened { account_id, .. }
            | AccountEvent::MoneyCredited { account_id, .. }
            | AccountEvent::MoneyDebited { account_id, .. }
            | AccountEvent::InterestAccrued { account_id, .. }
            | AccountEvent::AccountClosed { account_id, .. }
            | AccountEvent::AccountReopened { account_id, .. }
            | AccountEvent::OwnerChanged { account_id, .. }
            | AccountEvent::InterestRateChanged { account_id, .. }
            | AccountEvent::AccountFrozen { account_id, .. }
            | AccountEvent::AccountUnfrozen { account_id, .. } => *account_id,
            AccountEvent::TransferCompleted { from_account_id, .. } => *from_account_id,
        }
    }
}

/// Payload of the inbound `client.blocked` and `client.unblocked` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatusChanged {
    pub client_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_payload_is_camel_case_without_tag() {
        let event = AccountEvent::InterestAccrued {
            account_id: Uuid::nil(),
            run_id: Uuid::nil(),
            amount: dec!(1.23),
            currency: "EUR".to_string(),
            balance_after: dec!(101.23),
            period_from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            period_to: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["accountId"], Uuid::nil().to_string());
        assert_eq!(value["periodFrom"], "2026-01-01");
        assert_eq!(value["balanceAfter"], "101.23");
        assert!(value.get("type").is_none());
        assert_eq!(event.event_type(), "InterestAccrued");
    }

    #[test]
    fn test_transfer_attributed_to_source() {
        let from = Uuid::new_v4();
        let event = AccountEvent::TransferCompleted {
            transfer_id: Uuid::new_v4(),
            from_account_id: from,
            to_account_id: Uuid::new_v4(),
            amount: dec!(10),
            currency: "EUR".to_string(),
            completed_at: Utc::now(),
        };
        assert_eq!(event.aggregate_id(), from);
    }

    #[test]
    fn test_client_status_payload() {
        let client_id = Uuid::new_v4();
        let payload: ClientStatusChanged =
            serde_json::from_value(serde_json::json!({ "clientId": client_id })).unwrap();
        assert_eq!(payload.client_id, client_id);
    }
}
