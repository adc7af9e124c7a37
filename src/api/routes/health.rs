//! Health Routes
//!
//! - GET /health/live - process is alive
//! - GET /health/ready - store answers and the coordinator is dispatching

use axum::{extract::State, http::StatusCode};
use std::sync::Arc;

use crate::api::state::AppState;

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    let store = Arc::clone(&state.store);
    let store_ok = tokio::task::spawn_blocking(move || store.count(None).is_ok())
        .await
        .unwrap_or(false);

    if store_ok && state.coordinator.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
