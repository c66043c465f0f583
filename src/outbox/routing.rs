//! Routing table: outbox record type → topic routing key.

/// Routing key for event types without a mapping
pub const UNKNOWN_ROUTING_KEY: &str = "unknown";

/// Binding of the audit-all queue
pub const AUDIT_BINDINGS: [&str; 1] = ["#"];

/// Map an event type to its routing key. Total and deterministic.
pub fn routing_key(event_type: &str) -> &'static str {
    match event_type {
        "AccountOpened" => "account.opened",
        "MoneyCredited" => "money.credited",
        "MoneyDebited" => "money.debited",
        "TransferCompleted" => "money.transfer.completed",
        "InterestAccrued" => "money.interest.accrued",
        "AccountClosed" => "account.closed",
        "AccountReopened" => "account.reopened",
        "OwnerChanged" => "account.ownerChanged",
        "InterestRateChanged" => "account.rateChanged",
        "AccountFrozen" => "account.frozen",
        "AccountUnfrozen" => "account.unfrozen",
        _ => UNKNOWN_ROUTING_KEY,
    }
}
