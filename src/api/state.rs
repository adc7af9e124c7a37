//! Application State
//!
//! Handles to the running components, shared by all handlers.

use crate::cache::IntelligentCache;
use crate::coordinator::ImportCoordinator;
use crate::scheduler::Scheduler;
use crate::storage::MeasurementStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ImportCoordinator>,
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<IntelligentCache>,
    pub store: Arc<MeasurementStore>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        coordinator: Arc<ImportCoordinator>,
        scheduler: Arc<Scheduler>,
        cache: Arc<IntelligentCache>,
        store: Arc<MeasurementStore>,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            cache,
            store,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8085
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ApiConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
