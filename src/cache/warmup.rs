//! Cache pre-population for the hottest read paths

use crate::cache::{
    station_tag, CacheError, CacheResult, IntelligentCache, SetOptions, AGGREGATES_TAG,
};
use crate::storage::{Granularity, MeasurementStore};
use crate::weather::WeatherProvider;
use chrono::Local;
use serde::Serialize;
use std::sync::Arc;

/// Counts from one warmup pass
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct WarmReport {
    pub stations: usize,
    pub entries: usize,
    pub failures: usize,
}

pub struct CacheWarmer {
    store: Arc<MeasurementStore>,
    cache: Arc<IntelligentCache>,
    weather: Option<Arc<dyn WeatherProvider>>,
    /// Held across every pass, including blocking work a dropped pass left behind
    running: Arc<tokio::sync::Mutex<()>>,
}

impl CacheWarmer {
    pub fn new(store: Arc<MeasurementStore>, cache: Arc<IntelligentCache>) -> Self {
        Self {
            store,
            cache,
            weather: None,
            running: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Builder method: also warm current weather per station
    pub fn with_weather(mut self, weather: Arc<dyn WeatherProvider>) -> Self {
        self.weather = Some(weather);
        self
    }

    /// Write latest reading, last day of hourly buckets and weather per station
    pub async fn warm(&self) -> CacheResult<WarmReport> {
        let guard = Arc::clone(&self.running).lock_owned().await;

        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let (guard, warmed) = tokio::task::spawn_blocking(move || {
            let warmed = warm_from_store(&store, &cache);
            (guard, warmed)
        })
        .await?;
        let (stations, mut report) = warmed?;

        if let Some(weather) = &self.weather {
            let mut observations = Vec::new();
            for station in &stations {
                match weather.current(station).await {
                    Ok(observation) => observations.push((station.clone(), observation)),
                    Err(e) => {
                        report.failures += 1;
                        tracing::warn!(
                            station = %station,
                            provider = %weather.name(),
                            error = %e,
                            "Weather unavailable during warmup"
                        );
                    }
                }
            }

            let cache = Arc::clone(&self.cache);
            report.entries += tokio::task::spawn_blocking(move || {
                let _guard = guard;
                for (station, observation) in &observations {
                    cache.set(
                        &format!("realtime:weather:{}", station),
                        observation,
                        SetOptions::new().tag(station_tag(station)),
                    )?;
                }
                Ok::<_, CacheError>(observations.len())
            })
            .await??;
        }

        tracing::debug!(
            stations = report.stations,
            entries = report.entries,
            failures = report.failures,
            "Cache warmed"
        );
        Ok(report)
    }
}

/// Store-backed keys; runs on the blocking pool
fn warm_from_store(
    store: &MeasurementStore,
    cache: &IntelligentCache,
) -> CacheResult<(Vec<String>, WarmReport)> {
    let stations = match store.stations() {
        Ok(stations) => stations,
        Err(e) => {
            tracing::warn!(error = %e, "Cache warmup could not list stations");
            let report = WarmReport {
                failures: 1,
                ..WarmReport::default()
            };
            return Ok((Vec::new(), report));
        }
    };

    let mut report = WarmReport {
        stations: stations.len(),
        ..WarmReport::default()
    };
    let since = Local::now().naive_local() - chrono::Duration::hours(24);

    for station in &stations {
        let tag = station_tag(station);

        match store.latest(station) {
            Ok(Some(latest)) => {
                cache.set(
                    &format!("realtime:latest:{}", station),
                    &latest,
                    SetOptions::new().tag(tag.clone()),
                )?;
                report.entries += 1;
            }
            Ok(None) => {}
            Err(e) => {
                report.failures += 1;
                tracing::warn!(station = %station, error = %e, "Failed to load latest measurement");
            }
        }

        match store.buckets(Granularity::Hourly, station, Some(since)) {
            Ok(buckets) => {
                cache.set(
                    &format!("agg:hourly:{}", station),
                    &buckets,
                    SetOptions::new().tag(tag).tag(AGGREGATES_TAG),
                )?;
                report.entries += 1;
            }
            Err(e) => {
                report.failures += 1;
                tracing::warn!(station = %station, error = %e, "Failed to load hourly buckets");
            }
        }
    }

    Ok((stations, report))
}
