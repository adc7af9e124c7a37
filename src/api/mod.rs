//! Status API
//!
//! Read-only HTTP surface over the running service, built with Axum.
//!
//! # Endpoints
//!
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /status` - Coordinator heartbeat, scheduler, cache and store statistics
//! - `GET /jobs/:id` - One import job

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::status::StatusResponse;
pub use state::{ApiConfig, AppState};

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness));

    Router::new()
        .route("/status", get(routes::status::status))
        .route("/jobs/:id", get(routes::jobs::get_job))
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(state: AppState, config: &ApiConfig, shutdown: F) -> ApiResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "Status API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Status API shut down");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, IntelligentCache};
    use crate::coordinator::{CoordinatorConfig, ImportCoordinator, Priority};
    use crate::ingest::{ProcessorConfig, RowProcessor};
    use crate::scheduler::Scheduler;
    use crate::storage::MeasurementStore;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    struct TestApp {
        router: Router,
        coordinator: Arc<ImportCoordinator>,
        dir: tempfile::TempDir,
    }

    fn create_test_app() -> TestApp {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeasurementStore::open(dir.path().join("store.db")).unwrap());
        let processor = Arc::new(RowProcessor::new(
            Arc::clone(&store),
            ProcessorConfig::default(),
        ));
        let coordinator = Arc::new(ImportCoordinator::new(processor, CoordinatorConfig::default()));
        let cache = Arc::new(
            IntelligentCache::open(CacheConfig::with_dir(dir.path().join("cache"))).unwrap(),
        );
        let state = AppState::new(
            Arc::clone(&coordinator),
            Arc::new(Scheduler::new()),
            cache,
            store,
        );

        TestApp {
            router: build_router(state),
            coordinator,
            dir,
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health_live() {
        let app = create_test_app();
        let (status, _) = get(app.router, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_requires_running_coordinator() {
        let app = create_test_app();
        let (status, _) = get(app.router.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        app.coordinator.start();
        let (status, _) = get(app.router, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        app.coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_status_reports_queue() {
        let app = create_test_app();
        let file = app.dir.path().join("a.csv");
        std::fs::write(&file, "Systemzeit;LAeq\n").unwrap();
        app.coordinator.submit("ort", &file, Priority::Normal).unwrap();

        let (status, body) = get(app.router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["coordinator"]["queue_depth"], 1);
        assert_eq!(body["coordinator"]["running"], false);
        assert_eq!(body["store"]["records"], 0);
        assert!(body["scheduler"].as_object().unwrap().is_empty());
        assert_eq!(body["cache"]["hits"], 0);
    }

    #[tokio::test]
    async fn test_job_lookup() {
        let app = create_test_app();
        let file = app.dir.path().join("b.csv");
        std::fs::write(&file, "Systemzeit;LAeq\n").unwrap();
        let id = app.coordinator.submit("ort", &file, Priority::High).unwrap();

        let (status, body) = get(app.router.clone(), &format!("/jobs/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["station"], "ort");
        assert_eq!(body["priority"], "high");
        assert_eq!(body["status"], "queued");

        let (status, body) = get(app.router.clone(), &format!("/jobs/{}", uuid::Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "JOB_NOT_FOUND");

        let (status, _) = get(app.router, "/jobs/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
