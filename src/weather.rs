//! Weather collaborator
//!
//! Fetched per station over HTTP and wrapped in [`FallbackWeather`], which
//! serves the last good observation (flagged stale) while the source is down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum WeatherError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Weather source returned {status} for {station}")]
    Status { station: String, status: u16 },

    #[error("Request timed out")]
    Timeout,

    #[error("No observation available for {0}")]
    Unavailable(String),

    #[error("Invalid weather configuration: {0}")]
    Config(String),
}

pub type WeatherResult<T> = Result<T, WeatherError>;

/// Weather source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// URL with a `{station}` placeholder
    pub url_template: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl WeatherConfig {
    /// URL for one station
    pub fn url_for(&self, station: &str) -> String {
        self.url_template
            .replace("{station}", &urlencoding::encode(station))
    }

    pub fn validate(&self) -> WeatherResult<()> {
        if !self.url_template.contains("{station}") {
            return Err(WeatherError::Config(
                "url_template must contain {station}".to_string(),
            ));
        }
        let sample = self.url_for("station");
        let parsed = reqwest::Url::parse(&sample)
            .map_err(|e| WeatherError::Config(format!("invalid url_template: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(WeatherError::Config(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }
        Ok(())
    }
}

/// Current conditions at a station
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeatherObservation {
    #[serde(default)]
    pub station: String,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub wind_speed_ms: Option<f64>,
    #[serde(default)]
    pub humidity_pct: Option<f64>,
    #[serde(default)]
    pub precipitation_mm: Option<f64>,
    /// Served from the fallback copy
    #[serde(default)]
    pub stale: bool,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn current(&self, station: &str) -> WeatherResult<WeatherObservation>;
}

/// JSON-over-HTTP weather source
pub struct HttpWeatherProvider {
    client: Client,
    config: WeatherConfig,
}

impl HttpWeatherProvider {
    pub fn new(config: WeatherConfig) -> WeatherResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl WeatherProvider for HttpWeatherProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn current(&self, station: &str) -> WeatherResult<WeatherObservation> {
        let url = self.config.url_for(station);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                WeatherError::Timeout
            } else {
                WeatherError::Request(e)
            }
        })?;

        if !response.status().is_success() {
            return Err(WeatherError::Status {
                station: station.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut observation: WeatherObservation = response.json().await?;
        observation.station = station.to_string();
        observation.stale = false;
        Ok(observation)
    }
}

/// Wraps a provider with a last-known-good copy per station
pub struct FallbackWeather {
    inner: Arc<dyn WeatherProvider>,
    last_good: RwLock<HashMap<String, WeatherObservation>>,
}

impl FallbackWeather {
    pub fn new(inner: Arc<dyn WeatherProvider>) -> Self {
        Self {
            inner,
            last_good: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WeatherProvider for FallbackWeather {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn current(&self, station: &str) -> WeatherResult<WeatherObservation> {
        match self.inner.current(station).await {
            Ok(observation) => {
                self.last_good
                    .write()
                    .await
                    .insert(station.to_string(), observation.clone());
                Ok(observation)
            }
            Err(e) => {
                let cached = self.last_good.read().await.get(station).cloned();
                match cached {
                    Some(mut observation) => {
                        tracing::warn!(
                            station = %station,
                            provider = %self.inner.name(),
                            error = %e,
                            "Weather fetch failed, serving last observation"
                        );
                        observation.stale = true;
                        Ok(observation)
                    }
                    None => Err(e),
                }
            }
        }
    }
}

/// Resolve the configured provider once at startup
pub fn from_config(config: Option<&WeatherConfig>) -> WeatherResult<Option<Arc<dyn WeatherProvider>>> {
    match config {
        Some(config) => {
            let http: Arc<dyn WeatherProvider> = Arc::new(HttpWeatherProvider::new(config.clone())?);
            Ok(Some(Arc::new(FallbackWeather::new(http))))
        }
        None => Ok(None),
    }
}
