//! Scheduler for named, timer-driven jobs
//!
//! Guarantees per job:
//! - never runs concurrently with itself; a tick that finds it in flight is
//!   skipped, not queued, and blocking bodies go through a [`BlockingSlot`]
//!   that outlives a timed-out attempt
//! - every attempt is bounded by a timeout and aborted when it expires
//! - failed attempts retry with exponential backoff up to `max_attempts`,
//!   then the run is abandoned until the next natural tick
//!
//! Failures never stop or delay the job's timer.

pub mod error;
pub mod tasks;

pub use error::{SchedulerError, SchedulerResult};
pub use tasks::{AggregateTask, CacheWarmupTask, RetentionTask};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Work run by the scheduler
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    /// One attempt; an `Err` message counts as a failed attempt
    async fn run(&self) -> Result<(), String>;
}

/// Exclusive slot for the blocking body of one task
///
/// A timeout only drops the attempt's future; work already on the blocking
/// pool keeps the slot until it returns, and the next attempt waits for it.
#[derive(Debug, Clone, Default)]
pub struct BlockingSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl BlockingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the blocking pool once the slot is free
    pub async fn run<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f()
        })
        .await
        .map_err(|e| e.to_string())
    }

    /// A body is running or an attempt holds the slot
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// Timing and retry rules for one job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobSchedule {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each further one
    pub backoff: Duration,
}

impl JobSchedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            timeout: interval,
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }

    /// Builder method: per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder method: attempts per run
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder method: base retry delay
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Config-file form of [`JobSchedule`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl ScheduleConfig {
    pub fn new(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval_secs,
            timeout_secs,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }

    pub fn to_schedule(&self) -> JobSchedule {
        JobSchedule::every(Duration::from_secs(self.interval_secs))
            .timeout(Duration::from_secs(self.timeout_secs))
            .max_attempts(self.max_attempts)
            .backoff(Duration::from_millis(self.backoff_ms))
    }
}

/// Run history of one job
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobRunStats {
    /// Runs started (each may contain several attempts)
    pub runs: u64,
    pub successes: u64,
    /// Failed attempts, timeouts included
    pub failures: u64,
    /// Ticks skipped because the previous run was still in flight
    pub skipped: u64,
    /// Runs given up after exhausting their attempts
    pub abandoned: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_flight: bool,
}

struct RegisteredJob {
    task: Arc<dyn ScheduledTask>,
    schedule: JobSchedule,
    in_flight: AtomicBool,
    stats: Mutex<JobRunStats>,
}

impl RegisteredJob {
    fn update(&self, f: impl FnOnce(&mut JobRunStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

pub struct Scheduler {
    jobs: HashMap<String, Arc<RegisteredJob>>,
    shutdown: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    runs: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: HashMap::new(),
            shutdown,
            timers: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Add a job; a job with the same name is replaced
    pub fn register(&mut self, task: Arc<dyn ScheduledTask>, schedule: JobSchedule) {
        let name = task.name().to_string();
        tracing::debug!(
            job = %name,
            interval_secs = schedule.interval.as_secs(),
            timeout_secs = schedule.timeout.as_secs(),
            "Job registered"
        );
        self.jobs.insert(
            name,
            Arc::new(RegisteredJob {
                task,
                schedule,
                in_flight: AtomicBool::new(false),
                stats: Mutex::new(JobRunStats::default()),
            }),
        );
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start one timer per job; the first tick comes one interval from now
    pub fn start(self: &Arc<Self>) {
        self.shutdown.send_replace(false);
        let mut timers = match self.timers.lock() {
            Ok(timers) => timers,
            Err(e) => {
                tracing::error!(error = %e, "Scheduler timer list lock poisoned");
                return;
            }
        };
        if !timers.is_empty() {
            return;
        }

        for (name, job) in &self.jobs {
            let this = Arc::clone(self);
            let job = Arc::clone(job);
            let name = name.clone();
            let mut shutdown = self.shutdown.subscribe();

            timers.push(tokio::spawn(async move {
                let period = job.schedule.interval.max(Duration::from_millis(1));
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            this.fire(&name, &job);
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        tracing::info!(jobs = self.jobs.len(), "Scheduler started");
    }

    /// Stop timers and abort runs still in flight
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let timers: Vec<JoinHandle<()>> = self
            .timers
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for timer in timers {
            let _ = timer.await;
        }

        let runs: Vec<JoinHandle<()>> = self
            .runs
            .lock()
            .map(|mut r| r.drain(..).collect())
            .unwrap_or_default();
        for run in runs {
            run.abort();
            let _ = run.await;
        }

        for job in self.jobs.values() {
            job.in_flight.store(false, Ordering::SeqCst);
            job.update(|s| s.in_flight = false);
        }
        tracing::info!("Scheduler stopped");
    }

    /// Run `name` now unless it is already in flight
    ///
    /// Returns whether a run was started.
    pub fn trigger(&self, name: &str) -> SchedulerResult<bool> {
        let job = self
            .jobs
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        Ok(self.fire(name, job))
    }

    fn fire(&self, name: &str, job: &Arc<RegisteredJob>) -> bool {
        if job.in_flight.swap(true, Ordering::SeqCst) {
            job.update(|s| s.skipped += 1);
            tracing::debug!(job = %name, "Previous run still in flight, skipping tick");
            return false;
        }

        job.update(|s| {
            s.runs += 1;
            s.in_flight = true;
            s.last_started = Some(Utc::now());
        });

        let job = Arc::clone(job);
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            run_with_retries(&name, &job).await;
            job.update(|s| {
                s.in_flight = false;
                s.last_finished = Some(Utc::now());
            });
            job.in_flight.store(false, Ordering::SeqCst);
        });

        if let Ok(mut runs) = self.runs.lock() {
            runs.retain(|r| !r.is_finished());
            runs.push(handle);
        }
        true
    }

    /// Per-job statistics
    pub fn status(&self) -> BTreeMap<String, JobRunStats> {
        self.jobs
            .iter()
            .map(|(name, job)| {
                let stats = job.stats.lock().map(|s| s.clone()).unwrap_or_default();
                (name.clone(), stats)
            })
            .collect()
    }
}

async fn run_with_retries(name: &str, job: &RegisteredJob) {
    let schedule = job.schedule;
    let attempts = schedule.max_attempts.max(1);

    for attempt in 1..=attempts {
        let error = match tokio::time::timeout(schedule.timeout, job.task.run()).await {
            Ok(Ok(())) => {
                job.update(|s| {
                    s.successes += 1;
                    s.last_error = None;
                });
                tracing::debug!(job = %name, attempt, "Job succeeded");
                return;
            }
            Ok(Err(message)) => SchedulerError::Failed {
                job: name.to_string(),
                message,
            },
            Err(_) => SchedulerError::Timeout {
                job: name.to_string(),
                timeout: schedule.timeout,
            },
        };

        tracing::warn!(job = %name, attempt, max_attempts = attempts, error = %error, "Job attempt failed");
        job.update(|s| {
            s.failures += 1;
            s.last_error = Some(error.to_string());
        });

        if attempt < attempts {
            let shift = (attempt - 1).min(16);
            tokio::time::sleep(schedule.backoff.saturating_mul(1u32 << shift)).await;
        }
    }

    job.update(|s| s.abandoned += 1);
    tracing::error!(job = %name, attempts, "Job abandoned until next tick");
}
