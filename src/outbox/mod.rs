//! Transactional outbox
//!
//! Events are staged as outbox rows in the same storage transaction as the
//! mutation that produced them, then delivered by the [`OutboxDispatcher`].
//! An event is therefore published if and only if its mutation committed.

pub mod dispatcher;
pub mod publisher;
pub mod record;
pub mod routing;

pub use dispatcher::{DispatchReport, OutboxDispatcher};
pub use publisher::{OutboxPublisher, PublishError};
pub use record::{FailureOutcome, OutboxRecord, POISON_MARKER};
pub use routing::{routing_key, AUDIT_BINDINGS, UNKNOWN_ROUTING_KEY};

use uuid::Uuid;

use crate::domain::{AccountEvent, OperationContext};
use crate::store::{StoreError, StoreTx};

/// Stage an event for delivery inside the caller's transaction.
///
/// Returns the event id. Nothing becomes visible unless the transaction
/// commits.
pub async fn stage(
    tx: &mut dyn StoreTx,
    event: &AccountEvent,
    context: &OperationContext,
) -> Result<Uuid, StoreError> {
    let record = OutboxRecord::from_event(event, context)?;
    tx.add_outbox(&record).await?;

    tracing::trace!(
        outbox_id = %record.id,
        event_type = %record.event_type,
        "Outbox record staged"
    );
    Ok(record.id)
}
