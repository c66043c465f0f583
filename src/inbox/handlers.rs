//! Inbound message handlers
//!
//! A handler applies the effect of one inbound event inside the consumer's
//! transaction. It must not commit: the consumer records the inbox marker in
//! the same transaction and commits both together.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::concurrency::{self, GuardError};
use crate::domain::{ClientStatusChanged, DomainError, EventEnvelope};
use crate::outbox;
use crate::store::{IsolationLevel, StoreError, StoreTx};

/// Handler failure, classified for the retry policy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Infrastructure hiccup; the whole attempt may be re-run
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Defect of the message itself; retrying cannot help
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        // A lost version race is worth re-running against fresh reads
        if err.is_transient() || err.is_conflict() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

impl From<DomainError> for HandlerError {
    fn from(err: DomainError) -> Self {
        HandlerError::Permanent(format!("{}: {}", err.code(), err))
    }
}

impl From<GuardError> for HandlerError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Store(e) => e.into(),
            GuardError::Domain(e) => e.into(),
            other => HandlerError::Permanent(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(format!("invalid payload: {}", err))
    }
}

/// Effect of one inbound event type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable name; part of the inbox key
    fn name(&self) -> &'static str;

    /// Routing key this handler consumes
    fn routing_key(&self) -> &'static str;

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    async fn handle(
        &self,
        tx: &mut dyn StoreTx,
        envelope: &EventEnvelope<serde_json::Value>,
    ) -> Result<(), HandlerError>;
}

/// Handlers by routing key
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `client.blocked` and `client.unblocked`
    pub fn with_defaults() -> Self {
        Self::new()
            .register(Arc::new(ClientStatusHandler::blocked()))
            .register(Arc::new(ClientStatusHandler::unblocked()))
    }

    pub fn register(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(handler.routing_key(), handler);
        self
    }

    pub fn get(&self, routing_key: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(routing_key).cloned()
    }

    pub fn routing_keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.handlers.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

// =========================================================================
// Client status handlers
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientAction {
    Block,
    Unblock,
}

/// Freezes or unfreezes every open account of a client
#[derive(Debug, Clone)]
pub struct ClientStatusHandler {
    action: ClientAction,
}

impl ClientStatusHandler {
    pub fn blocked() -> Self {
        Self {
            action: ClientAction::Block,
        }
    }

    pub fn unblocked() -> Self {
        Self {
            action: ClientAction::Unblock,
        }
    }
}

#[async_trait]
impl MessageHandler for ClientStatusHandler {
    fn name(&self) -> &'static str {
        match self.action {
            ClientAction::Block => "client-blocked",
            ClientAction::Unblock => "client-unblocked",
        }
    }

    fn routing_key(&self) -> &'static str {
        match self.action {
            ClientAction::Block => "client.blocked",
            ClientAction::Unblock => "client.unblocked",
        }
    }

    async fn handle(
        &self,
        tx: &mut dyn StoreTx,
        envelope: &EventEnvelope<serde_json::Value>,
    ) -> Result<(), HandlerError> {
        let payload: ClientStatusChanged = serde_json::from_value(envelope.payload.clone())?;
        let client_id: Uuid = payload.client_id;
        let context = envelope.downstream_context();

        let accounts = tx.accounts_by_owner(client_id).await?;
        let mut changed = 0;

        for mut account in accounts.into_iter().filter(|a| a.is_open()) {
            let event = match self.action {
                ClientAction::Block => account.freeze(client_id),
                ClientAction::Unblock => account.unfreeze(client_id),
            };
            let Some(event) = event else {
                continue;
            };

            concurrency::write(tx, &mut account).await?;
            outbox::stage(tx, &event, &context).await?;
            changed += 1;
        }

        tracing::info!(
            handler = self.name(),
            client_id = %client_id,
            accounts_changed = changed,
            event_id = %envelope.event_id,
            "Client status applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        let conflict = StoreError::Conflict {
            entity: "Account",
            id: Uuid::nil(),
        };
        assert!(HandlerError::from(conflict).is_transient());
        assert!(HandlerError::from(StoreError::Unavailable("down".into())).is_transient());
        assert!(!HandlerError::from(StoreError::Corrupt("bad row".into())).is_transient());
    }

    #[test]
    fn test_domain_errors_are_permanent() {
        let err = HandlerError::from(DomainError::AccountClosed(Uuid::nil()));
        assert!(!err.is_transient());
        assert!(err.to_string().contains("account_closed"));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(registry.routing_keys(), vec!["client.blocked", "client.unblocked"]);
        assert_eq!(registry.get("client.blocked").unwrap().name(), "client-blocked");
        assert!(registry.get("client.deleted").is_none());
    }
}
