//! GET /status - heartbeat for operational dashboards

use axum::{extract::State, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::{error::ApiResult, state::AppState};
use crate::cache::CacheStats;
use crate::coordinator::CoordinatorSnapshot;
use crate::scheduler::JobRunStats;
use crate::storage::StoreStats;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_seconds: u64,
    pub coordinator: CoordinatorSnapshot,
    pub scheduler: BTreeMap<String, JobRunStats>,
    pub cache: CacheStats,
    /// Absent when the store could not be read
    pub store: Option<StoreStats>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let coordinator = state.coordinator.snapshot()?;

    let store = Arc::clone(&state.store);
    let store_stats = match tokio::task::spawn_blocking(move || store.stats()).await {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Store statistics unavailable");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Store statistics task failed");
            None
        }
    };

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        coordinator,
        scheduler: state.scheduler.status(),
        cache: state.cache.stats(),
        store: store_stats,
    }))
}
