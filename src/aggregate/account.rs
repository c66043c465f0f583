//! Account Aggregate
//!
//! Account is the financial aggregate whose balance and lifecycle every event
//! of the core is about. Commands mutate the in-memory state and return the
//! event to publish, or a [`DomainError`] when a business rule forbids them.
//! Persisting the new state (and detecting concurrent writers) is the job of
//! the [`concurrency`](crate::concurrency) guard.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::concurrency::ConcurrencyToken;
use crate::domain::{AccountEvent, Amount, Balance, CurrencyCode, DomainError};

use super::Aggregate;

/// Days in the interest year used by accrual
const DAYS_PER_YEAR: i64 = 365;

/// Annual rate ceiling, in percent
const MAX_INTEREST_RATE: Decimal = Decimal::ONE_HUNDRED;

/// Account type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Deposit,
    Checking,
    Credit,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Deposit => "deposit",
            AccountType::Checking => "checking",
            AccountType::Credit => "credit",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(AccountType::Deposit),
            "checking" => Ok(AccountType::Checking),
            "credit" => Ok(AccountType::Credit),
            other => Err(DomainError::BusinessRuleViolation(format!(
                "unknown account type '{}'",
                other
            ))),
        }
    }
}

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Open,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Open => "open",
            AccountStatus::Closed => "closed",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AccountStatus::Open),
            "closed" => Ok(AccountStatus::Closed),
            other => Err(DomainError::BusinessRuleViolation(format!(
                "unknown account status '{}'",
                other
            ))),
        }
    }
}

/// Account Aggregate
///
/// Fields are crate-visible so that storage engines can map rows without a
/// constructor per column; outside the crate the getters are the only view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub(crate) id: Uuid,
    pub(crate) owner_id: Uuid,
    pub(crate) account_type: AccountType,
    pub(crate) currency: CurrencyCode,
    pub(crate) balance: Balance,
    /// Annual rate in percent, deposit accounts only
    pub(crate) interest_rate: Option<Decimal>,
    pub(crate) status: AccountStatus,
    /// Blocked because the owning client is blocked upstream
    pub(crate) frozen: bool,
    pub(crate) opened_at: DateTime<Utc>,
    pub(crate) closed_at: Option<DateTime<Utc>>,
    pub(crate) last_accrual_date: Option<NaiveDate>,
    pub(crate) version: ConcurrencyToken,
}

impl Account {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a new account and generate the opening event
    pub fn open(
        account_id: Uuid,
        owner_id: Uuid,
        account_type: AccountType,
        currency: CurrencyCode,
        interest_rate: Option<Decimal>,
    ) -> Result<(Self, AccountEvent), DomainError> {
        if let Some(rate) = interest_rate {
            validate_rate(account_type, rate)?;
        }

        let now = Utc::now();
        let account = Self {
            id: account_id,
            owner_id,
            account_type,
            currency,
            balance: Balance::zero(),
            interest_rate,
            status: AccountStatus::Open,
            frozen: false,
            opened_at: now,
            closed_at: None,
            last_accrual_date: None,
            version: ConcurrencyToken::initial(),
        };

        let event = AccountEvent::AccountOpened {
            account_id,
            owner_id,
            account_type: account_type.as_str().to_string(),
            currency: account.currency.to_string(),
            interest_rate,
            opened_at: now,
        };

        Ok((account, event))
    }

    /// Close the account; only an empty account can be closed
    pub fn close(&mut self) -> Result<AccountEvent, DomainError> {
        self.ensure_open()?;

        if !self.balance.value().is_zero() {
            return Err(DomainError::NonZeroBalance {
                account_id: self.id,
                balance: self.balance.value(),
            });
        }

        let now = Utc::now();
        self.status = AccountStatus::Closed;
        self.closed_at = Some(now);

        Ok(AccountEvent::AccountClosed {
            account_id: self.id,
            closed_at: now,
        })
    }

    pub fn reopen(&mut self) -> Result<AccountEvent, DomainError> {
        if self.status != AccountStatus::Closed {
            return Err(DomainError::AccountNotClosed(self.id));
        }

        let now = Utc::now();
        self.status = AccountStatus::Open;
        self.closed_at = None;

        Ok(AccountEvent::AccountReopened {
            account_id: self.id,
            reopened_at: now,
        })
    }

    pub fn change_owner(&mut self, new_owner_id: Uuid) -> Result<AccountEvent, DomainError> {
        self.ensure_open()?;

        if new_owner_id == self.owner_id {
            return Err(DomainError::BusinessRuleViolation(
                "account already belongs to this owner".to_string(),
            ));
        }

        let previous_owner_id = self.owner_id;
        self.owner_id = new_owner_id;

        Ok(AccountEvent::OwnerChanged {
            account_id: self.id,
            previous_owner_id,
            new_owner_id,
            changed_at: Utc::now(),
        })
    }

    pub fn change_interest_rate(&mut self, new_rate: Decimal) -> Result<AccountEvent, DomainError> {
        self.ensure_open()?;
        validate_rate(self.account_type, new_rate)?;

        let previous_rate = self.interest_rate.replace(new_rate);

        Ok(AccountEvent::InterestRateChanged {
            account_id: self.id,
            previous_rate,
            new_rate,
            changed_at: Utc::now(),
        })
    }

    // =========================================================================
    // Money movement
    // =========================================================================

    /// Credit (deposit) money to the account
    pub fn credit(
        &mut self,
        amount: &Amount,
        transaction_id: Uuid,
        description: Option<String>,
    ) -> Result<AccountEvent, DomainError> {
        self.ensure_movable()?;

        self.balance = self
            .balance
            .credit(amount)
            .map_err(|e| DomainError::InvalidAmount(e.to_string()))?;

        Ok(AccountEvent::MoneyCredited {
            account_id: self.id,
            transaction_id,
            amount: amount.value(),
            currency: self.currency.to_string(),
            balance_after: self.balance.value(),
            description,
            credited_at: Utc::now(),
        })
    }

    /// Debit (withdraw) money from the account
    pub fn debit(
        &mut self,
        amount: &Amount,
        transaction_id: Uuid,
        description: Option<String>,
    ) -> Result<AccountEvent, DomainError> {
        self.ensure_movable()?;

        if !self.balance.is_sufficient_for(amount) {
            return Err(DomainError::insufficient_funds(
                amount.value(),
                self.balance.value(),
            ));
        }

        self.balance = self
            .balance
            .debit(amount)
            .map_err(|e| DomainError::InvalidAmount(e.to_string()))?;

        Ok(AccountEvent::MoneyDebited {
            account_id: self.id,
            transaction_id,
            amount: amount.value(),
            currency: self.currency.to_string(),
            balance_after: self.balance.value(),
            description,
            debited_at: Utc::now(),
        })
    }

    // =========================================================================
    // Client status
    // =========================================================================

    /// Freeze the account; `None` when it is already frozen
    pub fn freeze(&mut self, client_id: Uuid) -> Option<AccountEvent> {
        if self.frozen {
            return None;
        }
        self.frozen = true;

        Some(AccountEvent::AccountFrozen {
            account_id: self.id,
            client_id,
            frozen_at: Utc::now(),
        })
    }

    /// Unfreeze the account; `None` when it is not frozen
    pub fn unfreeze(&mut self, client_id: Uuid) -> Option<AccountEvent> {
        if !self.frozen {
            return None;
        }
        self.frozen = false;

        Some(AccountEvent::AccountUnfrozen {
            account_id: self.id,
            client_id,
            unfrozen_at: Utc::now(),
        })
    }

    // =========================================================================
    // Interest accrual
    // =========================================================================

    /// Whether the account takes part in interest accrual runs
    pub fn is_accrual_eligible(&self) -> bool {
        self.account_type == AccountType::Deposit
            && self.status == AccountStatus::Open
            && self.balance.is_positive()
    }

    /// Accrue simple interest from the last accrual date up to `as_of`.
    ///
    /// Returns `Ok(None)` when nothing is due: the account is not eligible,
    /// no days have elapsed, there is no rate, or the amount rounds to zero.
    /// In that case the accrual date is left untouched so the period keeps
    /// growing until it yields a bookable amount.
    pub fn accrue_interest(
        &mut self,
        as_of: NaiveDate,
        run_id: Uuid,
    ) -> Result<Option<AccountEvent>, DomainError> {
        if !self.is_accrual_eligible() {
            return Ok(None);
        }

        let rate = match self.interest_rate {
            Some(rate) if rate > Decimal::ZERO => rate,
            _ => return Ok(None),
        };

        let period_from = self.accrual_period_start();
        let days = (as_of - period_from).num_days();
        if days <= 0 {
            return Ok(None);
        }

        let raw = self
            .balance
            .value()
            .checked_mul(rate)
            .and_then(|v| v.checked_mul(Decimal::from(days)))
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED * Decimal::from(DAYS_PER_YEAR)))
            .ok_or_else(|| {
                DomainError::InvalidAmount(format!("interest overflow on account {}", self.id))
            })?;
        let Some(amount) = Amount::rounded(raw) else {
            return Ok(None);
        };

        self.balance = self
            .balance
            .credit(&amount)
            .map_err(|e| DomainError::InvalidAmount(e.to_string()))?;
        self.last_accrual_date = Some(as_of);

        Ok(Some(AccountEvent::InterestAccrued {
            account_id: self.id,
            run_id,
            amount: amount.value(),
            currency: self.currency.to_string(),
            balance_after: self.balance.value(),
            period_from,
            period_to: as_of,
        }))
    }

    fn accrual_period_start(&self) -> NaiveDate {
        self.last_accrual_date
            .unwrap_or_else(|| self.opened_at.date_naive())
    }

    // =========================================================================
    // Guards
    // =========================================================================

    fn ensure_open(&self) -> Result<(), DomainError> {
        if self.status == AccountStatus::Closed {
            return Err(DomainError::AccountClosed(self.id));
        }
        Ok(())
    }

    fn ensure_movable(&self) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.frozen {
            return Err(DomainError::AccountFrozen(self.id));
        }
        Ok(())
    }

    // =========================================================================
    // Getters
    // =========================================================================

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn account_type(&self) -> AccountType {
        self.account_type
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn balance(&self) -> &Balance {
        &self.balance
    }

    pub fn interest_rate(&self) -> Option<Decimal> {
        self.interest_rate
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == AccountStatus::Open
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn last_accrual_date(&self) -> Option<NaiveDate> {
        self.last_accrual_date
    }

    // =========================================================================
    // Test/seed helpers
    // =========================================================================

    /// Backdate the opening timestamp (seeding historical accounts)
    pub fn with_opened_at(mut self, opened_at: DateTime<Utc>) -> Self {
        self.opened_at = opened_at;
        self
    }

    /// Seed a starting balance without producing a movement event
    pub fn with_balance(mut self, balance: Balance) -> Self {
        self.balance = balance;
        self
    }
}

impl Aggregate for Account {
    fn aggregate_type() -> &'static str {
        "Account"
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> ConcurrencyToken {
        self.version
    }
}

fn validate_rate(account_type: AccountType, rate: Decimal) -> Result<(), DomainError> {
    if account_type != AccountType::Deposit {
        return Err(DomainError::InterestRateNotApplicable(
            account_type.as_str().to_string(),
        ));
    }
    if rate < Decimal::ZERO {
        return Err(DomainError::BusinessRuleViolation(
            "interest rate cannot be negative".to_string(),
        ));
    }
    if rate > MAX_INTEREST_RATE {
        return Err(DomainError::BusinessRuleViolation(format!(
            "interest rate cannot exceed {}%",
            MAX_INTEREST_RATE
        )));
    }
    Ok(())
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn eur() -> CurrencyCode {
        CurrencyCode::new("EUR").unwrap()
    }

    fn deposit(rate: Option<Decimal>) -> Account {
        Account::open(Uuid::new_v4(), Uuid::new_v4(), AccountType::Deposit, eur(), rate)
            .unwrap()
            .0
    }

    fn amount(value: Decimal) -> Amount {
        Amount::new(value).unwrap()
    }

    #[test]
    fn test_open_account() {
        let owner = Uuid::new_v4();
        let (account, event) =
            Account::open(Uuid::new_v4(), owner, AccountType::Checking, eur(), None).unwrap();

        assert_eq!(account.owner_id(), owner);
        assert_eq!(account.balance().value(), Decimal::ZERO);
        assert_eq!(account.version(), ConcurrencyToken::initial());
        assert!(account.is_open());
        assert_eq!(event.event_type(), "AccountOpened");
    }

    #[test]
    fn test_rate_only_on_deposit_accounts() {
        let result = Account::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AccountType::Checking,
            eur(),
            Some(dec!(1.5)),
        );
        assert!(matches!(result, Err(DomainError::InterestRateNotApplicable(_))));
    }

    #[test]
    fn test_rate_above_ceiling_rejected() {
        let result = Account::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AccountType::Deposit,
            eur(),
            Some(dec!(100.01)),
        );
        assert!(matches!(result, Err(DomainError::BusinessRuleViolation(_))));

        let mut account = deposit(Some(dec!(2)));
        assert!(account.change_interest_rate(dec!(100)).is_ok());
        assert!(matches!(
            account.change_interest_rate(dec!(100000000000000000000)),
            Err(DomainError::BusinessRuleViolation(_))
        ));
        assert_eq!(account.interest_rate(), Some(dec!(100)));
    }

    #[test]
    fn test_credit_and_debit() {
        let mut account = deposit(None);
        account.credit(&amount(dec!(100)), Uuid::new_v4(), None).unwrap();
        let event = account.debit(&amount(dec!(30)), Uuid::new_v4(), None).unwrap();

        assert_eq!(account.balance().value(), dec!(70));
        match event {
            AccountEvent::MoneyDebited { balance_after, .. } => assert_eq!(balance_after, dec!(70)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_debit_insufficient_funds() {
        let mut account = deposit(None);
        account.credit(&amount(dec!(10)), Uuid::new_v4(), None).unwrap();

        let result = account.debit(&amount(dec!(10.01)), Uuid::new_v4(), None);
        assert!(matches!(result, Err(DomainError::InsufficientFunds { .. })));
        assert_eq!(account.balance().value(), dec!(10));
    }

    #[test]
    fn test_frozen_account_rejects_movement() {
        let mut account = deposit(None);
        assert!(account.freeze(Uuid::new_v4()).is_some());
        assert!(account.freeze(Uuid::new_v4()).is_none());

        let result = account.credit(&amount(dec!(1)), Uuid::new_v4(), None);
        assert!(matches!(result, Err(DomainError::AccountFrozen(_))));

        assert!(account.unfreeze(Uuid::new_v4()).is_some());
        assert!(account.credit(&amount(dec!(1)), Uuid::new_v4(), None).is_ok());
    }

    #[test]
    fn test_close_requires_zero_balance() {
        let mut account = deposit(None);
        account.credit(&amount(dec!(5)), Uuid::new_v4(), None).unwrap();
        assert!(matches!(account.close(), Err(DomainError::NonZeroBalance { .. })));

        account.debit(&amount(dec!(5)), Uuid::new_v4(), None).unwrap();
        account.close().unwrap();
        assert_eq!(account.status(), AccountStatus::Closed);

        let result = account.credit(&amount(dec!(1)), Uuid::new_v4(), None);
        assert!(matches!(result, Err(DomainError::AccountClosed(_))));

        account.reopen().unwrap();
        assert!(matches!(account.reopen(), Err(DomainError::AccountNotClosed(_))));
    }

    #[test]
    fn test_accrue_interest() {
        let opened = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let mut account = deposit(Some(dec!(3.65)))
            .with_opened_at(opened)
            .with_balance(Balance::new(dec!(1000)).unwrap());

        let as_of = NaiveDate::from_ymd_opt(2026, 1, 11).unwrap();
        let event = account.accrue_interest(as_of, Uuid::new_v4()).unwrap().unwrap();

        // 1000 * 3.65% * 10 / 365 = 1.00
        assert_eq!(account.balance().value(), dec!(1001.00));
        assert_eq!(account.last_accrual_date(), Some(as_of));
        match event {
            AccountEvent::InterestAccrued { amount, period_from, period_to, .. } => {
                assert_eq!(amount, dec!(1.00));
                assert_eq!(period_from, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
                assert_eq!(period_to, as_of);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Same day again: nothing due
        assert!(account.accrue_interest(as_of, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_accrual_too_small_keeps_date() {
        let opened = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut account = deposit(Some(dec!(0.01)))
            .with_opened_at(opened)
            .with_balance(Balance::new(dec!(10)).unwrap());

        let as_of = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        assert!(account.accrue_interest(as_of, Uuid::new_v4()).unwrap().is_none());
        assert_eq!(account.last_accrual_date(), None);
    }

    #[test]
    fn test_accrual_skips_ineligible() {
        let mut account = deposit(Some(dec!(5)));
        let as_of = Utc::now().date_naive() + chrono::Duration::days(30);

        // zero balance
        assert!(!account.is_accrual_eligible());
        assert!(account.accrue_interest(as_of, Uuid::new_v4()).unwrap().is_none());

        // no rate
        let mut account = deposit(None).with_balance(Balance::new(dec!(100)).unwrap());
        assert!(account.is_accrual_eligible());
        assert!(account.accrue_interest(as_of, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_accrual_overflow_is_an_error() {
        let opened = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut account = deposit(None)
            .with_opened_at(opened)
            .with_balance(Balance::new(dec!(1000000000000)).unwrap());
        account.interest_rate = Some(dec!(100000000000000000000));

        let as_of = NaiveDate::from_ymd_opt(2026, 12, 31).unwrap();
        let result = account.accrue_interest(as_of, Uuid::new_v4());
        assert!(matches!(result, Err(DomainError::InvalidAmount(_))));
        assert_eq!(account.balance().value(), dec!(1000000000000));
        assert_eq!(account.last_accrual_date(), None);
    }

    #[test]
    fn test_accrual_past_balance_cap_is_an_error() {
        let opened = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut account = deposit(Some(dec!(5)))
            .with_opened_at(opened)
            .with_balance(Balance::new(dec!(999999999999.00)).unwrap());

        let as_of = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let result = account.accrue_interest(as_of, Uuid::new_v4());
        assert!(matches!(result, Err(DomainError::InvalidAmount(_))));
        assert_eq!(account.last_accrual_date(), None);
    }

    #[test]
    fn test_account_type_parse() {
        assert_eq!("deposit".parse::<AccountType>().unwrap(), AccountType::Deposit);
        assert!("savings".parse::<AccountType>().is_err());
        assert_eq!("closed".parse::<AccountStatus>().unwrap(), AccountStatus::Closed);
    }
}
