//! API Routes
//!
//! Operational endpoints: health, poisoned outbox records and their replay,
//! inbox dead letters.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::inbox::InboxDeadLetterRecord;
use crate::outbox::OutboxRecord;
use crate::store::Storage;

/// Shared router state
pub type AppState = Arc<dyn Storage>;

const MAX_LIMIT: i64 = 1000;

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

impl ListQuery {
    fn clamped(&self) -> i64 {
        self.limit.clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct PoisonedListResponse {
    pub records: Vec<OutboxRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub id: Uuid,
    pub replayed: bool,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub dead_letters: Vec<InboxDeadLetterRecord>,
    pub count: usize,
}

// =========================================================================
// Router
// =========================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ops/outbox/poisoned", get(list_poisoned))
        .route("/ops/outbox/:id/replay", post(replay_outbox))
        .route("/ops/inbox/dead-letters", get(list_dead_letters))
}

/// Health check endpoint; fails when the store is unreachable
async fn health_check(State(storage): State<AppState>) -> (StatusCode, &'static str) {
    match storage.ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
        }
    }
}

// =========================================================================
// GET /ops/outbox/poisoned
// =========================================================================

async fn list_poisoned(
    State(storage): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<PoisonedListResponse>, AppError> {
    let records = storage.poisoned_outbox(query.clamped()).await?;

    Ok(Json(PoisonedListResponse {
        count: records.len(),
        records,
    }))
}

// =========================================================================
// POST /ops/outbox/:id/replay
// =========================================================================

/// Return a poisoned record to the pending set
async fn replay_outbox(
    State(storage): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayResponse>, AppError> {
    if storage.outbox_record(id).await?.is_none() {
        return Err(AppError::OutboxRecordNotFound(id.to_string()));
    }

    if !storage.replay_outbox(id).await? {
        return Err(AppError::NotPoisoned(id.to_string()));
    }

    tracing::warn!(outbox_id = %id, "Poisoned outbox record replayed by operator");

    Ok(Json(ReplayResponse { id, replayed: true }))
}

// =========================================================================
// GET /ops/inbox/dead-letters
// =========================================================================

async fn list_dead_letters(
    State(storage): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DeadLetterListResponse>, AppError> {
    let dead_letters = storage.dead_letters(query.clamped()).await?;

    Ok(Json(DeadLetterListResponse {
        count: dead_letters.len(),
        dead_letters,
    }))
}
