//! Import Coordinator
//!
//! ```text
//! submit ─▶ JobQueue (priority, FIFO ties) ─▶ dispatch loop
//!                                               │ active < max_concurrent
//!                                               ▼
//!                JoinSet<(JobId, spawn_blocking(RowProcessor))>
//!                                               │ results
//!                                               ▼
//!                               stats, history, ImportEvent broadcast
//! ```
//!
//! - Only queued jobs can be cancelled; an active job runs to completion or
//!   failure so the store and the checkpoint never disagree.
//! - A path is processed by at most one worker at a time; a second job for a
//!   busy path waits in the queue.

pub mod error;
pub mod events;
pub mod job;
pub mod queue;

pub use error::{CoordinatorError, CoordinatorResult};
pub use events::ImportEvent;
pub use job::{ImportJob, JobId, JobStatus, Priority};
pub use queue::JobQueue;

use crate::ingest::{is_sidecar, FileOutcome, RowProcessor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinHandle, JoinSet};

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Hard cap on simultaneously processed files
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Finished jobs kept for lookup
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// File extension picked up by directory submission
    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Half the available parallelism, at least 2
pub fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(2)
}

fn default_history_size() -> usize {
    200
}

fn default_extension() -> String {
    "csv".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            history_size: default_history_size(),
            extension: default_extension(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Per-station execution statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StationStats {
    pub executions: u64,
    pub failures: u64,
    /// Cumulative average over all executions
    pub avg_duration_ms: f64,
    pub rows_inserted: u64,
}

impl StationStats {
    fn record(&mut self, duration: Duration, failed: bool, inserted: u64) {
        self.executions += 1;
        if failed {
            self.failures += 1;
        }
        self.rows_inserted += inserted;
        let ms = duration.as_secs_f64() * 1000.0;
        self.avg_duration_ms += (ms - self.avg_duration_ms) / self.executions as f64;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorTotals {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rows_inserted: u64,
}

/// Heartbeat view for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub running: bool,
    pub paused: bool,
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub queued: Vec<JobId>,
    pub active: Vec<ImportJob>,
    pub last_file_processed: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub peak_active: usize,
    pub totals: CoordinatorTotals,
    pub stations: BTreeMap<String, StationStats>,
}

#[derive(Default)]
struct State {
    queue: JobQueue,
    /// Queued and active jobs
    jobs: HashMap<JobId, ImportJob>,
    active_paths: HashSet<PathBuf>,
    active: usize,
    history: VecDeque<ImportJob>,
    stations: BTreeMap<String, StationStats>,
    totals: CoordinatorTotals,
    peak_active: usize,
    last_file_processed: Option<String>,
    last_activity_at: Option<DateTime<Utc>>,
}

struct WorkerResult {
    id: JobId,
    result: Result<FileOutcome, String>,
    duration: Duration,
}

/// A worker's job id travels outside the blocking task so a lost worker can
/// still be finished
type Joined = (JobId, Result<WorkerResult, tokio::task::JoinError>);

pub struct ImportCoordinator {
    processor: Arc<RowProcessor>,
    config: CoordinatorConfig,
    state: Mutex<State>,
    events: broadcast::Sender<ImportEvent>,
    wake: Notify,
    running: AtomicBool,
    paused: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ImportCoordinator {
    pub fn new(processor: Arc<RowProcessor>, config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            processor,
            config,
            state: Mutex::new(State::default()),
            events,
            wake: Notify::new(),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn lock(&self) -> CoordinatorResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| CoordinatorError::Lock(format!("Failed to acquire coordinator lock: {}", e)))
    }

    fn emit(&self, event: ImportEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.events.subscribe()
    }

    // ==================== Submission ====================

    /// Queue one file; fails fast when it does not exist
    pub fn submit(
        &self,
        station: &str,
        path: impl AsRef<Path>,
        priority: Priority,
    ) -> CoordinatorResult<JobId> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CoordinatorError::FileNotFound(path.to_path_buf()));
        }

        let mut state = self.lock()?;

        if let Some(existing) = state
            .jobs
            .values()
            .find(|j| j.status == JobStatus::Queued && j.path == path)
        {
            tracing::debug!(job = %existing.id, file = %path.display(), "File already queued");
            return Ok(existing.id);
        }

        let job = ImportJob::new(station, path, priority);
        let id = job.id;
        state.queue.push(id, priority);
        state.jobs.insert(id, job);
        state.totals.submitted += 1;
        drop(state);

        tracing::info!(
            job = %id,
            station = %station,
            file = %path.display(),
            priority = %priority,
            "Import queued"
        );
        self.emit(ImportEvent::Queued {
            job_id: id,
            station: station.to_string(),
            file: path.display().to_string(),
            priority,
        });
        self.wake.notify_one();
        Ok(id)
    }

    /// Queue every matching file in `dir`, in file-name order
    pub fn submit_directory(
        &self,
        station: &str,
        dir: impl AsRef<Path>,
        priority: Priority,
    ) -> CoordinatorResult<Vec<JobId>> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CoordinatorError::DirectoryMissing(dir.to_path_buf()));
        }

        let mut files = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let path = dirent?.path();
            if path.is_file() && self.matches_extension(&path) {
                files.push(path);
            }
        }
        files.sort();

        files
            .iter()
            .map(|path| self.submit(station, path, priority))
            .collect()
    }

    /// Whether `path` is a source file this coordinator accepts
    pub fn matches_extension(&self, path: &Path) -> bool {
        !is_sidecar(path)
            && path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(&self.config.extension))
                .unwrap_or(false)
    }

    /// Cancel a job that has not started yet
    pub fn cancel(&self, id: JobId) -> CoordinatorResult<()> {
        let mut state = self.lock()?;

        let status = match state.jobs.get(&id) {
            Some(job) => job.status,
            None => {
                return match state.history.iter().find(|j| j.id == id) {
                    Some(job) => Err(CoordinatorError::NotCancellable {
                        id,
                        status: job.status,
                    }),
                    None => Err(CoordinatorError::JobNotFound(id)),
                }
            }
        };

        if status != JobStatus::Queued {
            return Err(CoordinatorError::NotCancellable { id, status });
        }

        state.queue.remove(id);
        if let Some(mut job) = state.jobs.remove(&id) {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Utc::now());
            state.totals.cancelled += 1;
            self.push_history(&mut state, job);
        }
        drop(state);

        tracing::info!(job = %id, "Import cancelled");
        self.emit(ImportEvent::Cancelled { job_id: id });
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Stop dispatching new jobs; queued jobs stay queued
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("Import coordinator paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        tracing::info!("Import coordinator resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the dispatch loop
    pub fn start(self: &Arc<Self>) {
        let mut dispatcher = match self.dispatcher.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!(error = %e, "Dispatcher handle lock poisoned");
                return;
            }
        };
        if dispatcher.is_some() {
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        *dispatcher = Some(tokio::spawn(async move { this.dispatch_loop().await }));

        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            "Import coordinator started"
        );
    }

    /// Stop dispatching and wait for active jobs to finish
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();

        let handle = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        tracing::info!("Import coordinator stopped");
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut workers: JoinSet<Joined> = JoinSet::new();
        let cap = self.config.max_concurrent.max(1);

        while self.is_running() {
            while !self.is_paused() && workers.len() < cap {
                let job = match self.next_job() {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to take next job");
                        break;
                    }
                };

                self.emit(ImportEvent::Started {
                    job_id: job.id,
                    station: job.station.clone(),
                    file: job.path.display().to_string(),
                });

                let this = Arc::clone(&self);
                let id = job.id;
                workers.spawn(async move {
                    (id, tokio::task::spawn_blocking(move || this.execute(job)).await)
                });
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.on_joined(joined);
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            self.on_joined(joined);
        }
    }

    fn on_joined(&self, joined: Result<Joined, tokio::task::JoinError>) {
        let done = match joined {
            Ok((_, Ok(result))) => result,
            Ok((id, Err(e))) => {
                tracing::error!(job = %id, error = %e, "Import worker aborted");
                WorkerResult {
                    id,
                    result: Err(format!("import worker aborted: {}", e)),
                    duration: Duration::ZERO,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Import worker task lost");
                return;
            }
        };

        if let Err(e) = self.finish(done) {
            tracing::error!(error = %e, "Failed to record job result");
        }
    }

    /// Pop the highest-priority job whose path is not already being processed
    fn next_job(&self) -> CoordinatorResult<Option<ImportJob>> {
        let mut state = self.lock()?;
        let mut deferred = Vec::new();
        let mut picked = None;

        while let Some(entry) = state.queue.pop() {
            let path = match state.jobs.get(&entry.id) {
                Some(job) => job.path.clone(),
                None => continue,
            };
            if state.active_paths.contains(&path) {
                deferred.push(entry);
                continue;
            }
            picked = Some((entry.id, path));
            break;
        }
        for entry in deferred {
            state.queue.restore(entry);
        }

        let Some((id, path)) = picked else {
            return Ok(None);
        };

        state.active_paths.insert(path);
        state.active += 1;
        state.peak_active = state.peak_active.max(state.active);
        state.last_activity_at = Some(Utc::now());

        let job = match state.jobs.get_mut(&id) {
            Some(job) => job,
            None => return Ok(None),
        };
        job.status = JobStatus::Active;
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    /// Runs on the blocking pool
    fn execute(&self, job: ImportJob) -> WorkerResult {
        let started = Instant::now();
        let id = job.id;

        tracing::debug!(job = %id, station = %job.station, file = %job.path.display(), "Import started");

        let on_progress = |rows: u64| {
            if let Ok(mut state) = self.state.lock() {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.progress_rows = rows;
                }
            }
            self.emit(ImportEvent::Progress { job_id: id, rows });
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.processor
                .process_file_with_progress(&job.station, &job.path, on_progress)
        }));

        let result = match outcome {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("import worker panicked".to_string()),
        };

        WorkerResult {
            id,
            result,
            duration: started.elapsed(),
        }
    }

    fn finish(&self, done: WorkerResult) -> CoordinatorResult<()> {
        let mut state = self.lock()?;
        let Some(mut job) = state.jobs.remove(&done.id) else {
            return Ok(());
        };

        state.active_paths.remove(&job.path);
        state.active = state.active.saturating_sub(1);
        state.last_activity_at = Some(Utc::now());
        state.last_file_processed = Some(job.path.display().to_string());
        job.finished_at = Some(Utc::now());

        let inserted = done.result.as_ref().map(|o| o.inserted).unwrap_or(0);
        state
            .stations
            .entry(job.station.clone())
            .or_default()
            .record(done.duration, done.result.is_err(), inserted);

        let event = match done.result {
            Ok(outcome) => {
                job.status = JobStatus::Completed;
                job.outcome = Some(outcome.clone());
                state.totals.completed += 1;
                state.totals.rows_inserted += outcome.inserted;
                ImportEvent::Completed {
                    job_id: job.id,
                    outcome,
                }
            }
            Err(error) => {
                tracing::error!(
                    job = %job.id,
                    station = %job.station,
                    file = %job.path.display(),
                    error = %error,
                    "Import failed"
                );
                job.status = JobStatus::Failed;
                job.error = Some(error.clone());
                state.totals.failed += 1;
                ImportEvent::Failed {
                    job_id: job.id,
                    station: job.station.clone(),
                    file: job.path.display().to_string(),
                    error,
                }
            }
        };

        self.push_history(&mut state, job);
        drop(state);

        self.emit(event);
        self.wake.notify_one();
        Ok(())
    }

    fn push_history(&self, state: &mut State, job: ImportJob) {
        state.history.push_back(job);
        while state.history.len() > self.config.history_size {
            state.history.pop_front();
        }
    }

    // ==================== Observability ====================

    /// Look up a queued, active or recently finished job
    pub fn job(&self, id: JobId) -> Option<ImportJob> {
        let state = self.lock().ok()?;
        state
            .jobs
            .get(&id)
            .cloned()
            .or_else(|| state.history.iter().rev().find(|j| j.id == id).cloned())
    }

    pub fn snapshot(&self) -> CoordinatorResult<CoordinatorSnapshot> {
        let state = self.lock()?;
        let mut active: Vec<ImportJob> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|j| j.started_at);

        Ok(CoordinatorSnapshot {
            running: self.is_running(),
            paused: self.is_paused(),
            max_concurrent: self.config.max_concurrent,
            queue_depth: state.queue.len(),
            queued: state.queue.ordered(),
            active,
            last_file_processed: state.last_file_processed.clone(),
            last_activity_at: state.last_activity_at,
            peak_active: state.peak_active,
            totals: state.totals.clone(),
            stations: state.stations.clone(),
        })
    }

    /// Wait until `id` reaches a final state
    pub async fn wait(&self, id: JobId) -> CoordinatorResult<ImportJob> {
        let mut events = self.subscribe();

        loop {
            match self.job(id) {
                Some(job) if job.status.is_finished() => return Ok(job),
                Some(_) => {}
                None => return Err(CoordinatorError::JobNotFound(id)),
            }

            match events.recv().await {
                Ok(event) if event.job_id() == id && event.is_terminal() => {}
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(CoordinatorError::Stopped(id)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ProcessorConfig;
    use crate::storage::MeasurementStore;
    use tempfile::tempdir;

    fn create_test_coordinator(max_concurrent: usize) -> (Arc<ImportCoordinator>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeasurementStore::open(dir.path().join("store.db")).unwrap());
        let processor = Arc::new(RowProcessor::new(
            store,
            ProcessorConfig {
                retry_delay: Duration::from_millis(1),
                busy_backoff: Duration::from_millis(1),
                ..ProcessorConfig::default()
            },
        ));
        let coordinator = Arc::new(ImportCoordinator::new(
            processor,
            CoordinatorConfig {
                max_concurrent,
                ..CoordinatorConfig::default()
            },
        ));
        (coordinator, dir)
    }

    fn station_file(dir: &Path, name: &str, rows: usize) -> PathBuf {
        let mut content = String::from("Datum;Systemzeit;LAeq\n");
        for i in 0..rows {
            content.push_str(&format!("09.03.2024;{:02}:{:02}:00;{}\n", i / 60, i % 60, 40 + i % 30));
        }
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_submit_missing_file_fails_fast() {
        let (coordinator, dir) = create_test_coordinator(2);
        let err = coordinator
            .submit("ort", dir.path().join("nope.csv"), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::FileNotFound(_)));

        let err = coordinator
            .submit_directory("ort", dir.path().join("nodir"), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DirectoryMissing(_)));
        assert_eq!(coordinator.snapshot().unwrap().totals.submitted, 0);
    }

    #[test]
    fn test_duplicate_queued_path_returns_same_job() {
        let (coordinator, dir) = create_test_coordinator(2);
        let path = station_file(dir.path(), "a.csv", 3);

        let first = coordinator.submit("ort", &path, Priority::Normal).unwrap();
        let second = coordinator.submit("ort", &path, Priority::High).unwrap();
        assert_eq!(first, second);
        assert_eq!(coordinator.snapshot().unwrap().queue_depth, 1);
    }

    #[test]
    fn test_submit_directory_filters_files() {
        let (coordinator, dir) = create_test_coordinator(2);
        let station_dir = dir.path().join("ort");
        std::fs::create_dir(&station_dir).unwrap();
        station_file(&station_dir, "b.csv", 1);
        station_file(&station_dir, "a.CSV", 1);
        std::fs::write(station_dir.join("notes.txt"), "x").unwrap();
        std::fs::write(station_dir.join("a.CSV.checkpoint.json"), "{}").unwrap();

        let ids = coordinator
            .submit_directory("ort", &station_dir, Priority::Low)
            .unwrap();
        assert_eq!(ids.len(), 2);
        let first = coordinator.job(ids[0]).unwrap();
        assert!(first.path.ends_with("a.CSV"));
    }

    #[test]
    fn test_cancel_only_queued() {
        let (coordinator, dir) = create_test_coordinator(2);
        let path = station_file(dir.path(), "a.csv", 3);
        let id = coordinator.submit("ort", &path, Priority::Normal).unwrap();

        coordinator.cancel(id).unwrap();
        assert_eq!(coordinator.job(id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(coordinator.snapshot().unwrap().queue_depth, 0);

        assert!(matches!(
            coordinator.cancel(id),
            Err(CoordinatorError::NotCancellable { status: JobStatus::Cancelled, .. })
        ));
        assert!(matches!(
            coordinator.cancel(uuid::Uuid::new_v4()),
            Err(CoordinatorError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dequeue_order_follows_priority() {
        let (coordinator, dir) = create_test_coordinator(1);
        let mut events = coordinator.subscribe();

        coordinator.pause();
        coordinator.start();

        let urgent = coordinator
            .submit("ort", station_file(dir.path(), "u.csv", 2), Priority::Urgent)
            .unwrap();
        let low = coordinator
            .submit("ort", station_file(dir.path(), "l.csv", 2), Priority::Low)
            .unwrap();
        let high = coordinator
            .submit("ort", station_file(dir.path(), "h.csv", 2), Priority::High)
            .unwrap();
        assert_eq!(coordinator.snapshot().unwrap().queued, vec![urgent, high, low]);

        coordinator.resume();
        coordinator.wait(low).await.unwrap();

        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ImportEvent::Started { job_id, .. } = event {
                started.push(job_id);
            }
        }
        assert_eq!(started, vec![urgent, high, low]);
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_active_jobs_never_exceed_cap() {
        let (coordinator, dir) = create_test_coordinator(2);
        coordinator.start();

        let ids: Vec<JobId> = (0..6)
            .map(|i| {
                let path = station_file(dir.path(), &format!("f{}.csv", i), 200);
                coordinator.submit(&format!("s{}", i % 3), path, Priority::Normal).unwrap()
            })
            .collect();

        for id in &ids {
            let job = coordinator.wait(*id).await.unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.outcome.unwrap().inserted, 200);
        }

        let snapshot = coordinator.snapshot().unwrap();
        assert!(snapshot.peak_active <= 2);
        assert!(snapshot.peak_active >= 1);
        assert_eq!(snapshot.totals.completed, 6);
        assert_eq!(snapshot.totals.rows_inserted, 1200);
        assert_eq!(snapshot.stations["s0"].executions, 2);
        assert!(snapshot.active.is_empty());
        assert!(snapshot.last_file_processed.is_some());

        coordinator.stop().await;
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_failed_file_is_surfaced() {
        let (coordinator, dir) = create_test_coordinator(2);
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, b"Systemzeit;LAeq\n10:00:00;\xff\n").unwrap();

        let mut events = coordinator.subscribe();
        coordinator.start();
        let id = coordinator.submit("ort", &path, Priority::Normal).unwrap();

        let job = coordinator.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("3 attempts"));

        let snapshot = coordinator.snapshot().unwrap();
        assert_eq!(snapshot.totals.failed, 1);
        assert_eq!(snapshot.stations["ort"].failures, 1);

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            saw_failed |= matches!(event, ImportEvent::Failed { job_id, .. } if job_id == id);
        }
        assert!(saw_failed);
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_aborted_worker_fails_job_and_releases_path() {
        let (coordinator, dir) = create_test_coordinator(1);
        let path = station_file(dir.path(), "a.csv", 1);
        let id = coordinator.submit("ort", &path, Priority::Normal).unwrap();

        let job = coordinator.next_job().unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(coordinator.job(id).unwrap().status, JobStatus::Active);

        let lost = tokio::spawn(async { panic!("worker lost") }).await.unwrap_err();
        coordinator.on_joined(Ok((id, Err(lost))));

        let job = coordinator.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("aborted"));
        let snapshot = coordinator.snapshot().unwrap();
        assert!(snapshot.active.is_empty());
        assert_eq!(snapshot.totals.failed, 1);

        // the path is free for a new job
        let again = coordinator.submit("ort", &path, Priority::Normal).unwrap();
        assert_eq!(coordinator.next_job().unwrap().unwrap().id, again);
    }

    #[tokio::test]
    async fn test_stop_keeps_queue() {
        let (coordinator, dir) = create_test_coordinator(1);
        coordinator.pause();
        coordinator.start();
        coordinator
            .submit("ort", station_file(dir.path(), "a.csv", 1), Priority::Normal)
            .unwrap();

        coordinator.stop().await;
        let snapshot = coordinator.snapshot().unwrap();
        assert!(!snapshot.running);
        assert_eq!(snapshot.queue_depth, 1);
    }
}
