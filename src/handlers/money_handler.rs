//! Money Handler
//!
//! Deposits and withdrawals on a single account.

use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::concurrency::{self, ReadMode};
use crate::domain::{AccountEvent, Amount, OperationContext};
use crate::error::{AppError, AppResult};
use crate::outbox;
use crate::store::{IsolationLevel, Storage};

use super::{DepositCommand, MoneyResult, WithdrawCommand};

#[derive(Debug, Clone, Copy)]
enum Direction {
    Credit,
    Debit,
}

pub struct MoneyHandler {
    storage: Arc<dyn Storage>,
}

impl MoneyHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Credit money and stage `MoneyCredited`
    pub async fn deposit(
        &self,
        command: DepositCommand,
        context: &OperationContext,
    ) -> AppResult<MoneyResult> {
        self.execute(
            Direction::Credit,
            command.account_id,
            &command.amount,
            command.description,
            context,
        )
        .await
    }

    /// Debit money and stage `MoneyDebited`
    pub async fn withdraw(
        &self,
        command: WithdrawCommand,
        context: &OperationContext,
    ) -> AppResult<MoneyResult> {
        self.execute(
            Direction::Debit,
            command.account_id,
            &command.amount,
            command.description,
            context,
        )
        .await
    }

    async fn execute(
        &self,
        direction: Direction,
        account_id: Uuid,
        amount: &str,
        description: Option<String>,
        context: &OperationContext,
    ) -> AppResult<MoneyResult> {
        let amount: Amount = amount
            .parse()
            .map_err(|e| AppError::InvalidRequest(format!("Invalid amount: {}", e)))?;
        let transaction_id = Uuid::new_v4();

        let mut tx = self.storage.begin(IsolationLevel::ReadCommitted).await?;
        let (account, event) =
            concurrency::update_account(tx.as_mut(), account_id, ReadMode::Locked, |account| {
                match direction {
                    Direction::Credit => account.credit(&amount, transaction_id, description),
                    Direction::Debit => account.debit(&amount, transaction_id, description),
                }
            })
            .await?;
        outbox::stage(tx.as_mut(), &event, context).await?;
        tx.commit().await?;

        tracing::info!(
            account_id = %account_id,
            transaction_id = %transaction_id,
            event_type = event.event_type(),
            amount = %amount,
            correlation_id = %context.correlation_id,
            "Money movement committed"
        );

        let balance_after = match &event {
            AccountEvent::MoneyCredited { balance_after, .. }
            | AccountEvent::MoneyDebited { balance_after, .. } => *balance_after,
            _ => account.balance().value(),
        };

        Ok(MoneyResult {
            account_id,
            transaction_id,
            amount: amount.value(),
            balance_after,
            version: account.version(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Account, AccountType};
    use crate::domain::{Balance, CurrencyCode, DomainError};
    use crate::store::MemoryStorage;
    use rust_decimal_macros::dec;

    fn seeded(balance: rust_decimal::Decimal) -> (MemoryStorage, MoneyHandler, Uuid) {
        let storage = MemoryStorage::new();
        let (account, _) = Account::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AccountType::Checking,
            CurrencyCode::new("USD").unwrap(),
            None,
        )
        .unwrap();
        let id = account.id();
        storage.seed_account(account.with_balance(Balance::new(balance).unwrap()));
        (storage.clone(), MoneyHandler::new(Arc::new(storage)), id)
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let (storage, handler, id) = seeded(dec!(10));

        let deposited = handler
            .deposit(
                DepositCommand::new(id, "5.25").with_description("salary"),
                &OperationContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(deposited.balance_after, dec!(15.25));

        let withdrawn = handler
            .withdraw(WithdrawCommand::new(id, "15.25"), &OperationContext::new())
            .await
            .unwrap();
        assert_eq!(withdrawn.balance_after, dec!(0));
        assert_eq!(withdrawn.version.value(), 3);
        assert_eq!(storage.outbox_records().len(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_funds_writes_nothing() {
        let (storage, handler, id) = seeded(dec!(10));

        let err = handler
            .withdraw(WithdrawCommand::new(id, "10.01"), &OperationContext::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Domain(DomainError::InsufficientFunds { .. })
        ));
        assert_eq!(storage.account(id).unwrap().balance().value(), dec!(10));
        assert!(storage.outbox_records().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_amounts() {
        let (_, handler, id) = seeded(dec!(10));

        for amount in ["0", "-1", "1.005", "abc"] {
            let err = handler
                .deposit(DepositCommand::new(id, amount), &OperationContext::new())
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidRequest(_)), "{amount}");
        }
    }
}
