//! API module
//!
//! Operational HTTP endpoints.

pub mod routes;

pub use routes::{create_router, AppState};

use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    create_router()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
