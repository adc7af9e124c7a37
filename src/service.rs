//! Service assembly and lifecycle
//!
//! [`Service::build`] constructs every component from a [`Config`] and wires
//! them together explicitly. `start` launches the background parts in
//! dependency order and `stop` shuts them down in reverse.

use crate::aggregation::AggregationEngine;
use crate::api::{self, AppState};
use crate::cache::{CacheError, CacheWarmer, IntelligentCache, InvalidationSink};
use crate::config::Config;
use crate::coordinator::{ImportCoordinator, ImportEvent};
use crate::ingest::RowProcessor;
use crate::scheduler::{AggregateTask, CacheWarmupTask, RetentionTask, Scheduler};
use crate::storage::{default_retention_policies, MeasurementStore, StorageError};
use crate::watcher::ChangeDetector;
use crate::weather::{self, WeatherError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Weather error: {0}")]
    Weather(#[from] WeatherError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

pub struct Service {
    config: Config,
    store: Arc<MeasurementStore>,
    cache: Arc<IntelligentCache>,
    coordinator: Arc<ImportCoordinator>,
    engine: Arc<AggregationEngine>,
    scheduler: Arc<Scheduler>,
    detector: Arc<ChangeDetector>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    api: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    pub fn build(config: Config) -> ServiceResult<Self> {
        let db_path = config.storage.db_path();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Arc::new(MeasurementStore::with_busy_timeout(
            &db_path,
            Duration::from_millis(config.storage.busy_timeout_ms),
        )?);
        seed_retention(&store, &config)?;

        let cache = Arc::new(IntelligentCache::open(config.cache.clone())?);
        let sink: Arc<dyn InvalidationSink> = cache.clone();

        let processor = Arc::new(
            RowProcessor::new(Arc::clone(&store), config.ingest.clone())
                .with_invalidation(Arc::clone(&sink)),
        );
        let coordinator = Arc::new(ImportCoordinator::new(
            processor,
            config.coordinator.clone(),
        ));

        let engine = Arc::new(
            AggregationEngine::new(Arc::clone(&store), config.aggregation.to_engine_config())
                .with_invalidation(sink),
        );

        let mut warmer = CacheWarmer::new(Arc::clone(&store), Arc::clone(&cache));
        if let Some(provider) = weather::from_config(config.weather.as_ref())? {
            tracing::info!(provider = provider.name(), "Weather provider configured");
            warmer = warmer.with_weather(provider);
        }

        let mut scheduler = Scheduler::new();
        scheduler.register(
            Arc::new(AggregateTask::new(Arc::clone(&engine))),
            config.scheduler.aggregate.to_schedule(),
        );
        scheduler.register(
            Arc::new(RetentionTask::new(Arc::clone(&engine))),
            config.scheduler.retention.to_schedule(),
        );
        scheduler.register(
            Arc::new(CacheWarmupTask::new(Arc::new(warmer))),
            config.scheduler.cache_warmup.to_schedule(),
        );

        let detector = Arc::new(ChangeDetector::new(
            Arc::clone(&coordinator),
            config.stations.clone(),
            config.watcher.clone(),
        ));

        tracing::info!(
            db = %db_path.display(),
            stations = config.stations.len(),
            max_concurrent = config.coordinator.max_concurrent,
            "Service built"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            store,
            cache,
            coordinator,
            engine,
            scheduler: Arc::new(scheduler),
            detector,
            shutdown,
            background: Mutex::new(Vec::new()),
            api: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MeasurementStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<IntelligentCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<ImportCoordinator> {
        &self.coordinator
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start dispatching, timers, watches and the status API
    pub fn start(&self) {
        self.shutdown.send_replace(false);
        self.coordinator.start();
        self.scheduler.start();

        let mut background = match self.background.lock() {
            Ok(background) => background,
            Err(e) => {
                tracing::error!(error = %e, "Background task list lock poisoned");
                return;
            }
        };

        background.push(
            Arc::clone(&self.cache)
                .start_sweeper(Duration::from_secs(self.config.cache.sweep_interval_secs.max(1))),
        );

        if self.config.scheduler.aggregate_on_import {
            background.push(tokio::spawn(forward_completions(
                self.coordinator.subscribe(),
                Arc::clone(&self.scheduler),
            )));
        }

        drop(background);

        if self.config.api.enabled {
            let state = AppState::new(
                Arc::clone(&self.coordinator),
                Arc::clone(&self.scheduler),
                Arc::clone(&self.cache),
                Arc::clone(&self.store),
            );
            let api_config = self.config.api.clone();
            let mut shutdown = self.shutdown.subscribe();
            let handle = tokio::spawn(async move {
                let stop = async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                };
                if let Err(e) = api::serve(state, &api_config, stop).await {
                    tracing::error!(error = %e, addr = %api_config.addr(), "Status API failed");
                }
            });
            if let Ok(mut api) = self.api.lock() {
                *api = Some(handle);
            }
        }

        self.detector.start();
        tracing::info!("Service started");
    }

    /// Stop in reverse order; queued imports stay queued
    pub async fn stop(&self) {
        self.detector.stop().await;
        self.coordinator.stop().await;
        self.scheduler.stop().await;

        self.shutdown.send_replace(true);
        let api = self.api.lock().ok().and_then(|mut api| api.take());
        if let Some(mut api) = api {
            if tokio::time::timeout(Duration::from_secs(5), &mut api).await.is_err() {
                tracing::warn!("Status API did not drain in time");
                api.abort();
            }
        }

        let tasks: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .map(|mut b| b.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        tracing::info!("Service stopped");
    }
}

/// Default policies are inserted once; configured ones replace them but
/// keep their last cleanup time
fn seed_retention(store: &MeasurementStore, config: &Config) -> ServiceResult<()> {
    store.seed_retention_policies(&default_retention_policies())?;
    if config.retention.is_empty() {
        return Ok(());
    }

    let existing = store.retention_policies()?;
    for policy in &config.retention {
        let mut policy = policy.clone();
        if let Some(current) = existing.iter().find(|p| p.table == policy.table) {
            policy.last_cleanup = current.last_cleanup;
        }
        store.save_retention_policy(&policy)?;
    }
    Ok(())
}

async fn forward_completions(mut events: broadcast::Receiver<ImportEvent>, scheduler: Arc<Scheduler>) {
    loop {
        match events.recv().await {
            Ok(ImportEvent::Completed { job_id, .. }) => match scheduler.trigger(AggregateTask::NAME) {
                Ok(true) => tracing::debug!(job = %job_id, "Aggregation triggered by import"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to trigger aggregation"),
            },
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Import event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
