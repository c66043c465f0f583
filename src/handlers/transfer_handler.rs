//! Transfer Handler
//!
//! Moves money between two accounts in one serializable transaction: both
//! guarded writes and all three events commit together or not at all.

use std::sync::Arc;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::concurrency::{self, ReadMode};
use crate::domain::{AccountEvent, Amount, DomainError, OperationContext};
use crate::error::{AppError, AppResult};
use crate::outbox;
use crate::store::{IsolationLevel, Storage};

use super::{TransferCommand, TransferResult};

/// Handler for transfers between accounts
pub struct TransferHandler {
    storage: Arc<dyn Storage>,
}

impl TransferHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Execute the transfer command
    pub async fn execute(
        &self,
        command: TransferCommand,
        context: &OperationContext,
    ) -> AppResult<TransferResult> {
        if command.from_account_id == command.to_account_id {
            return Err(DomainError::SameAccountTransfer.into());
        }

        let amount: Amount = command
            .amount
            .parse()
            .map_err(|e| AppError::InvalidRequest(format!("Invalid amount: {}", e)))?;
        let transfer_id = Uuid::new_v4();

        let mut tx = self.storage.begin(IsolationLevel::Serializable).await?;

        // Lock in id order so that opposite transfers cannot deadlock
        let (first, second) = if command.from_account_id < command.to_account_id {
            (command.from_account_id, command.to_account_id)
        } else {
            (command.to_account_id, command.from_account_id)
        };
        let first = concurrency::load(tx.as_mut(), first, ReadMode::Locked).await?;
        let second = concurrency::load(tx.as_mut(), second, ReadMode::Locked).await?;
        let (mut from, mut to) = if first.id() == command.from_account_id {
            (first, second)
        } else {
            (second, first)
        };

        if from.currency() != to.currency() {
            return Err(DomainError::currency_mismatch(from.currency().as_str(), to.currency().as_str()).into());
        }

        let memo = command.memo.unwrap_or_else(|| "Transfer".to_string());
        let debited = from.debit(&amount, transfer_id, Some(memo.clone()))?;
        let credited = to.credit(&amount, transfer_id, Some(memo))?;
        let completed = AccountEvent::TransferCompleted {
            transfer_id,
            from_account_id: from.id(),
            to_account_id: to.id(),
            amount: amount.value(),
            currency: from.currency().to_string(),
            completed_at: chrono::Utc::now(),
        };

        concurrency::write(tx.as_mut(), &mut from).await?;
        concurrency::write(tx.as_mut(), &mut to).await?;
        for event in [&debited, &credited, &completed] {
            outbox::stage(tx.as_mut(), event, context).await?;
        }
        tx.commit().await?;

        tracing::info!(
            transfer_id = %transfer_id,
            from_account_id = %from.id(),
            to_account_id = %to.id(),
            amount = %amount,
            correlation_id = %context.correlation_id,
            "Transfer completed"
        );

        Ok(TransferResult {
            transfer_id,
            from_account_id: from.id(),
            to_account_id: to.id(),
            amount: amount.value(),
            status: "completed".to_string(),
        })
    }
}
