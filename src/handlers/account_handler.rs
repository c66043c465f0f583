//! Account Handler
//!
//! Lifecycle commands: open, close, reopen, change owner, change interest rate.

use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::{Account, Aggregate};
use crate::concurrency::{self, ReadMode};
use crate::domain::{AccountEvent, CurrencyCode, DomainError, OperationContext};
use crate::error::AppResult;
use crate::outbox;
use crate::store::{IsolationLevel, Storage};

use super::{
    AccountResult, ChangeInterestRateCommand, ChangeOwnerCommand, CloseAccountCommand,
    OpenAccountCommand, ReopenAccountCommand,
};

pub struct AccountHandler {
    storage: Arc<dyn Storage>,
}

impl AccountHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Open a new account and stage `AccountOpened`
    pub async fn open(
        &self,
        command: OpenAccountCommand,
        context: &OperationContext,
    ) -> AppResult<AccountResult> {
        let currency = CurrencyCode::new(&command.currency)?;
        let (account, event) = Account::open(
            Uuid::new_v4(),
            command.owner_id,
            command.account_type,
            currency,
            command.interest_rate,
        )?;

        let mut tx = self.storage.begin(IsolationLevel::ReadCommitted).await?;
        tx.insert_account(&account).await?;
        let event_id = outbox::stage(tx.as_mut(), &event, context).await?;
        tx.commit().await?;

        tracing::info!(
            account_id = %account.id(),
            owner_id = %command.owner_id,
            account_type = %command.account_type,
            correlation_id = %context.correlation_id,
            "Account opened"
        );

        Ok(AccountResult {
            account_id: account.id(),
            event_id,
            version: account.version(),
        })
    }

    pub async fn close(
        &self,
        command: CloseAccountCommand,
        context: &OperationContext,
    ) -> AppResult<AccountResult> {
        self.mutate(command.account_id, context, "Account closed", Account::close)
            .await
    }

    pub async fn reopen(
        &self,
        command: ReopenAccountCommand,
        context: &OperationContext,
    ) -> AppResult<AccountResult> {
        self.mutate(command.account_id, context, "Account reopened", Account::reopen)
            .await
    }

    pub async fn change_owner(
        &self,
        command: ChangeOwnerCommand,
        context: &OperationContext,
    ) -> AppResult<AccountResult> {
        let new_owner_id = command.new_owner_id;
        self.mutate(command.account_id, context, "Account owner changed", move |account| {
            account.change_owner(new_owner_id)
        })
        .await
    }

    pub async fn change_interest_rate(
        &self,
        command: ChangeInterestRateCommand,
        context: &OperationContext,
    ) -> AppResult<AccountResult> {
        let new_rate = command.new_rate;
        self.mutate(command.account_id, context, "Interest rate changed", move |account| {
            account.change_interest_rate(new_rate)
        })
        .await
    }

    /// begin → guarded mutation → stage → commit
    async fn mutate<F>(
        &self,
        account_id: Uuid,
        context: &OperationContext,
        message: &'static str,
        command: F,
    ) -> AppResult<AccountResult>
    where
        F: FnOnce(&mut Account) -> Result<AccountEvent, DomainError> + Send,
    {
        let mut tx = self.storage.begin(IsolationLevel::ReadCommitted).await?;
        let (account, event) =
            concurrency::update_account(tx.as_mut(), account_id, ReadMode::Snapshot, command).await?;
        let event_id = outbox::stage(tx.as_mut(), &event, context).await?;
        tx.commit().await?;

        tracing::info!(
            account_id = %account_id,
            event_type = event.event_type(),
            version = %account.version(),
            correlation_id = %context.correlation_id,
            "{}",
            message
        );

        Ok(AccountResult {
            account_id,
            event_id,
            version: account.version(),
        })
    }
}
