//! In-memory storage engine
//!
//! Transactional engine over a single mutex-protected state. Each transaction
//! stages its writes locally (reads see its own writes) and applies them at
//! commit after validating them against the committed state:
//!
//! - account updates are checked against the token at statement time and
//!   again at commit, so of two overlapping writers the first to commit wins;
//! - inbox markers are unique per (message, handler) across transactions;
//! - outbox rows claimed by an open transaction are invisible to other
//!   claimers until that transaction ends.
//!
//! There are no row locks: `load_account_for_update` behaves like a plain
//! read and a racing writer fails with a conflict instead of blocking.
//! Fault injection hooks simulate crashes and outages.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::aggregate::{Account, Aggregate};
use crate::concurrency::ConcurrencyToken;
use crate::inbox::record::{InboxDeadLetterRecord, InboxRecord};
use crate::outbox::record::OutboxRecord;

use super::{IsolationLevel, StoreError, StoreTx, Storage};

#[derive(Debug, Default)]
struct Faults {
    unavailable_begins: u32,
    failing_commits: u32,
    failing_outbox_saves: u32,
    reject_outbox_inserts: bool,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    outbox: HashMap<Uuid, OutboxRecord>,
    inbox: HashMap<(Uuid, String), InboxRecord>,
    dead_letters: HashMap<Uuid, InboxDeadLetterRecord>,
    claimed: HashSet<Uuid>,
    faults: Faults,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory storage; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    // =========================================================================
    // Seeding & inspection
    // =========================================================================

    /// Insert an account directly, bypassing transactions and events
    pub fn seed_account(&self, account: Account) {
        self.state().accounts.insert(account.id(), account);
    }

    pub fn account(&self, id: Uuid) -> Option<Account> {
        self.state().accounts.get(&id).cloned()
    }

    /// All outbox records in `occurred_at` order
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<_> = self.state().outbox.values().cloned().collect();
        records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        records
    }

    pub fn inbox_records(&self) -> Vec<InboxRecord> {
        let mut records: Vec<_> = self.state().inbox.values().cloned().collect();
        records.sort_by(|a, b| a.processed_at.cmp(&b.processed_at));
        records
    }

    pub fn dead_letter_records(&self) -> Vec<InboxDeadLetterRecord> {
        let mut records: Vec<_> = self.state().dead_letters.values().cloned().collect();
        records.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        records
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// The next `n` calls to `begin` fail as if the pool were exhausted
    pub fn fail_next_begins(&self, n: u32) {
        self.state().faults.unavailable_begins = n;
    }

    /// The next `n` commits fail and discard their writes (crash before commit)
    pub fn fail_next_commits(&self, n: u32) {
        self.state().faults.failing_commits = n;
    }

    /// The next `n` calls to `save_outbox` fail
    pub fn fail_next_outbox_saves(&self, n: u32) {
        self.state().faults.failing_outbox_saves = n;
    }

    /// Make every `add_outbox` fail until switched off
    pub fn reject_outbox_inserts(&self, reject: bool) {
        self.state().faults.reject_outbox_inserts = reject;
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTx>, StoreError> {
        {
            let mut state = self.state();
            if state.faults.unavailable_begins > 0 {
                state.faults.unavailable_begins -= 1;
                return Err(StoreError::Unavailable("connection pool exhausted".to_string()));
            }
        }

        tracing::trace!(isolation = isolation.as_sql(), "Memory transaction started");
        Ok(Box::new(MemoryTx::new(self.state.clone())))
    }

    async fn inbox_contains(&self, message_id: Uuid, handler: &str) -> Result<bool, StoreError> {
        Ok(self
            .state()
            .inbox
            .contains_key(&(message_id, handler.to_string())))
    }

    async fn dead_letter(&self, record: &InboxDeadLetterRecord) -> Result<bool, StoreError> {
        let mut state = self.state();
        if state.dead_letters.contains_key(&record.message_id) {
            return Ok(false);
        }
        state.dead_letters.insert(record.message_id, record.clone());
        Ok(true)
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<InboxDeadLetterRecord>, StoreError> {
        let mut records = self.dead_letter_records();
        records.truncate(clamp(limit));
        Ok(records)
    }

    async fn outbox_record(&self, id: Uuid) -> Result<Option<OutboxRecord>, StoreError> {
        Ok(self.state().outbox.get(&id).cloned())
    }

    async fn poisoned_outbox(&self, limit: i64) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut records: Vec<_> = self
            .outbox_records()
            .into_iter()
            .filter(OutboxRecord::is_poisoned)
            .collect();
        records.truncate(clamp(limit));
        Ok(records)
    }

    async fn replay_outbox(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state();
        match state.outbox.get_mut(&id) {
            Some(record) if record.is_poisoned() => {
                record.reset_for_replay();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_accrual_eligible(&self) -> Result<i64, StoreError> {
        let count = self
            .state()
            .accounts
            .values()
            .filter(|a| a.is_accrual_eligible())
            .count();
        Ok(count as i64)
    }

    async fn accrual_eligible_page(&self, page: i64, page_size: i64) -> Result<Vec<Uuid>, StoreError> {
        let mut ids: Vec<Uuid> = self
            .state()
            .accounts
            .values()
            .filter(|a| a.is_accrual_eligible())
            .map(|a| a.id())
            .collect();
        ids.sort();

        let size = clamp(page_size);
        Ok(ids.into_iter().skip(clamp(page) * size).take(size).collect())
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.account(id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn clamp(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

// =========================================================================
// Transaction
// =========================================================================

#[derive(Debug)]
struct StagedAccount {
    /// Committed token when this transaction first wrote the row
    base: ConcurrencyToken,
    account: Account,
}

#[derive(Debug)]
struct MemoryTx {
    state: Arc<Mutex<State>>,
    account_inserts: HashMap<Uuid, Account>,
    account_writes: HashMap<Uuid, StagedAccount>,
    outbox_inserts: Vec<OutboxRecord>,
    outbox_updates: HashMap<Uuid, OutboxRecord>,
    inbox_inserts: Vec<InboxRecord>,
    claimed: Vec<Uuid>,
}

impl MemoryTx {
    fn new(state: Arc<Mutex<State>>) -> Self {
        Self {
            state,
            account_inserts: HashMap::new(),
            account_writes: HashMap::new(),
            outbox_inserts: Vec::new(),
            outbox_updates: HashMap::new(),
            inbox_inserts: Vec::new(),
            claimed: Vec::new(),
        }
    }

    fn read_account(&self, id: Uuid) -> Option<Account> {
        if let Some(account) = self.account_inserts.get(&id) {
            return Some(account.clone());
        }
        if let Some(staged) = self.account_writes.get(&id) {
            return Some(staged.account.clone());
        }
        lock(&self.state).accounts.get(&id).cloned()
    }

    fn staged_inbox(&self, message_id: Uuid, handler: &str) -> bool {
        self.inbox_inserts
            .iter()
            .any(|r| r.message_id == message_id && r.handler_name == handler)
    }

    fn release_claims(&mut self, state: &mut State) {
        for id in self.claimed.drain(..) {
            state.claimed.remove(&id);
        }
    }

    fn validate(&self, state: &State) -> Result<(), StoreError> {
        for (id, staged) in &self.account_writes {
            let current = state.accounts.get(id).map(|a| a.version());
            if current != Some(staged.base) {
                return Err(StoreError::Conflict {
                    entity: Account::aggregate_type(),
                    id: *id,
                });
            }
        }

        for id in self.account_inserts.keys() {
            if state.accounts.contains_key(id) {
                return Err(StoreError::AlreadyExists {
                    entity: Account::aggregate_type(),
                    id: *id,
                });
            }
        }

        for record in &self.outbox_inserts {
            if state.outbox.contains_key(&record.id) {
                return Err(StoreError::AlreadyExists {
                    entity: "OutboxRecord",
                    id: record.id,
                });
            }
        }

        for record in &self.inbox_inserts {
            let key = (record.message_id, record.handler_name.clone());
            if state.inbox.contains_key(&key) {
                return Err(StoreError::DuplicateMessage {
                    message_id: record.message_id,
                    handler: record.handler_name.clone(),
                });
            }
        }

        Ok(())
    }

    fn apply(&mut self, state: &mut State) {
        for (id, account) in self.account_inserts.drain() {
            state.accounts.insert(id, account);
        }
        for (id, staged) in self.account_writes.drain() {
            state.accounts.insert(id, staged.account);
        }
        for record in self.outbox_inserts.drain(..) {
            state.outbox.insert(record.id, record);
        }
        for (id, update) in self.outbox_updates.drain() {
            if let Some(record) = state.outbox.get_mut(&id) {
                record.processed_at = update.processed_at;
                record.retry_count = update.retry_count;
                record.last_error = update.last_error;
            }
        }
        for record in self.inbox_inserts.drain(..) {
            state
                .inbox
                .insert((record.message_id, record.handler_name.clone()), record);
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.claimed.is_empty() {
            let state = self.state.clone();
            let mut guard = lock(&state);
            self.release_claims(&mut guard);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn load_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.read_account(id))
    }

    async fn load_account_for_update(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.read_account(id))
    }

    async fn accounts_by_owner(&mut self, owner_id: Uuid) -> Result<Vec<Account>, StoreError> {
        let mut ids: Vec<Uuid> = {
            let state = lock(&self.state);
            state
                .accounts
                .values()
                .filter(|a| a.owner_id() == owner_id)
                .map(|a| a.id())
                .collect()
        };
        ids.extend(
            self.account_inserts
                .values()
                .filter(|a| a.owner_id() == owner_id)
                .map(|a| a.id()),
        );
        ids.sort();
        ids.dedup();

        // Staged writes may have moved an account to or away from this owner
        Ok(ids
            .into_iter()
            .filter_map(|id| self.read_account(id))
            .filter(|a| a.owner_id() == owner_id)
            .collect())
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if self.read_account(account.id()).is_some() {
            return Err(StoreError::AlreadyExists {
                entity: Account::aggregate_type(),
                id: account.id(),
            });
        }
        self.account_inserts.insert(account.id(), account.clone());
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> Result<ConcurrencyToken, StoreError> {
        let id = account.id();
        let conflict = || StoreError::Conflict {
            entity: Account::aggregate_type(),
            id,
        };

        let current = self.read_account(id).ok_or_else(conflict)?;
        if current.version() != account.version() {
            return Err(conflict());
        }

        let next = account.version().next();
        let mut staged = account.clone();
        staged.version = next;

        if let Some(inserted) = self.account_inserts.get_mut(&id) {
            *inserted = staged;
        } else if let Some(write) = self.account_writes.get_mut(&id) {
            write.account = staged;
        } else {
            self.account_writes.insert(
                id,
                StagedAccount {
                    base: current.version(),
                    account: staged,
                },
            );
        }

        Ok(next)
    }

    async fn add_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError> {
        if lock(&self.state).faults.reject_outbox_inserts {
            return Err(StoreError::Unavailable("outbox insert rejected".to_string()));
        }
        self.outbox_inserts.push(record.clone());
        Ok(())
    }

    async fn claim_pending_outbox(&mut self, limit: i64) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut state = lock(&self.state);

        let mut pending: Vec<OutboxRecord> = state
            .outbox
            .values()
            .filter(|r| r.is_pending() && !state.claimed.contains(&r.id))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        pending.truncate(clamp(limit));

        for record in &pending {
            state.claimed.insert(record.id);
            self.claimed.push(record.id);
        }

        Ok(pending)
    }

    async fn save_outbox(&mut self, records: &[OutboxRecord]) -> Result<(), StoreError> {
        {
            let mut state = lock(&self.state);
            if state.faults.failing_outbox_saves > 0 {
                state.faults.failing_outbox_saves -= 1;
                return Err(StoreError::Unavailable("outbox save failed".to_string()));
            }
        }

        for record in records {
            self.outbox_updates.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn inbox_contains(&mut self, message_id: Uuid, handler: &str) -> Result<bool, StoreError> {
        if self.staged_inbox(message_id, handler) {
            return Ok(true);
        }
        Ok(lock(&self.state)
            .inbox
            .contains_key(&(message_id, handler.to_string())))
    }

    async fn record_inbox(&mut self, record: &InboxRecord) -> Result<(), StoreError> {
        if self.inbox_contains(record.message_id, &record.handler_name).await? {
            return Err(StoreError::DuplicateMessage {
                message_id: record.message_id,
                handler: record.handler_name.clone(),
            });
        }
        self.inbox_inserts.push(record.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let state = self.state.clone();
        let mut guard = lock(&state);

        let outcome = if guard.faults.failing_commits > 0 {
            guard.faults.failing_commits -= 1;
            Err(StoreError::Unavailable("connection lost during commit".to_string()))
        } else {
            self.validate(&guard)
        };

        if outcome.is_ok() {
            self.apply(&mut guard);
        }
        self.release_claims(&mut guard);
        outcome
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        let state = self.state.clone();
        let mut guard = lock(&state);
        self.release_claims(&mut guard);
        Ok(())
    }
}
