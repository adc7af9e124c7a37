//! GET /jobs/:id - one queued, active or recently finished import job

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use crate::coordinator::{CoordinatorError, ImportJob, JobId};

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ImportJob>> {
    let id: JobId = id
        .parse()
        .map_err(|_| ApiError::Validation(format!("Invalid job id: {}", id)))?;

    state
        .coordinator
        .job(id)
        .map(Json)
        .ok_or(ApiError::Coordinator(CoordinatorError::JobNotFound(id)))
}
