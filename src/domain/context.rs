//! Operation Context
//!
//! Causal metadata carried by every operation that may emit events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Causal identifiers for the current operation.
///
/// `correlation_id` is shared by every event of one causal chain (an HTTP
/// request and everything it triggers). `causation_id` identifies the immediate
/// trigger: the command id, the inbound event id or the scheduled job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

impl OperationContext {
    /// Start a new causal chain; the command itself is the first cause
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            correlation_id: id,
            causation_id: id,
        }
    }

    /// Continue an existing chain (e.g. the X-Correlation-Id of a request)
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Context for work triggered by an inbound event: same chain, new hop.
    pub fn caused_by(correlation_id: Uuid, event_id: Uuid) -> Self {
        Self {
            correlation_id,
            causation_id: event_id,
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}
