//! Concurrency Guard
//!
//! Optimistic write discipline for mutable aggregates: read the state together
//! with its [`ConcurrencyToken`], mutate in memory, then write back only if the
//! stored token is still the one that was read. A lost race surfaces as
//! [`StoreError::Conflict`] and is never retried here; the caller decides.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::aggregate::{Account, Aggregate};
use crate::domain::DomainError;
use crate::store::{StoreError, StoreTx};

/// Version stamp of an aggregate row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyToken(i64);

impl ConcurrencyToken {
    /// Token of a freshly inserted aggregate
    pub const fn initial() -> Self {
        Self(1)
    }

    pub const fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Token stored by a successful conditional write
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// How the aggregate is read before mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Plain read; conflicts are detected at write time
    Snapshot,
    /// Row lock held until the transaction ends
    Locked,
}

/// Failure of a guarded update
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GuardError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, GuardError::Store(e) if e.is_conflict())
    }
}

/// Load an account inside the transaction
pub async fn load(
    tx: &mut dyn StoreTx,
    id: Uuid,
    mode: ReadMode,
) -> Result<Account, GuardError> {
    let account = match mode {
        ReadMode::Snapshot => tx.load_account(id).await?,
        ReadMode::Locked => tx.load_account_for_update(id).await?,
    };

    account.ok_or(GuardError::NotFound {
        entity: Account::aggregate_type(),
        id,
    })
}

/// Write a mutated account back, conditioned on its token being unchanged.
///
/// On success the account carries the new token.
pub async fn write(tx: &mut dyn StoreTx, account: &mut Account) -> Result<(), StoreError> {
    let next = tx.update_account(account).await?;

    tracing::trace!(
        account_id = %account.id(),
        from = %account.version(),
        to = %next,
        "Guarded write applied"
    );

    account.version = next;
    Ok(())
}

/// Read, mutate and conditionally write one account.
///
/// The closure runs against the freshly read state; a business rule failure
/// aborts before anything is written.
pub async fn update_account<T, F>(
    tx: &mut dyn StoreTx,
    id: Uuid,
    mode: ReadMode,
    mutate: F,
) -> Result<(Account, T), GuardError>
where
    F: FnOnce(&mut Account) -> Result<T, DomainError> + Send,
    T: Send,
{
    let mut account = load(tx, id, mode).await?;
    let output = mutate(&mut account)?;
    write(tx, &mut account).await?;
    Ok((account, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_progression() {
        let token = ConcurrencyToken::initial();
        assert_eq!(token.value(), 1);
        assert_eq!(token.next().value(), 2);
        assert!(token.next() > token);
        assert_eq!(ConcurrencyToken::from_raw(7).to_string(), "v7");
    }

    #[test]
    fn test_guard_error_conflict_detection() {
        let conflict = GuardError::Store(StoreError::Conflict {
            entity: "Account",
            id: Uuid::nil(),
        });
        assert!(conflict.is_conflict());

        let missing = GuardError::NotFound {
            entity: "Account",
            id: Uuid::nil(),
        };
        assert!(!missing.is_conflict());
    }
}
