//! Change Detector
//!
//! One supervised watch per station directory. File events are bridged from
//! `notify`'s callback thread into a tokio channel, debounced, and submitted
//! to the [`ImportCoordinator`]. A watch that fails (directory missing,
//! backend error, closed stream) is re-established after `restart_delay`.

pub mod debounce;
pub mod error;

pub use debounce::Debouncer;
pub use error::{WatchError, WatchResult};

use crate::coordinator::{ImportCoordinator, Priority};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A station and the directory its files land in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationDir {
    pub name: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Settle window for bursts of events on one file
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Delay before re-establishing a failed watch
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Submit files already present when the watch starts
    #[serde(default = "default_scan_on_start")]
    pub scan_on_start: bool,
}

fn default_debounce_ms() -> u64 {
    1500
}

fn default_restart_delay_ms() -> u64 {
    5000
}

fn default_scan_on_start() -> bool {
    true
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            scan_on_start: default_scan_on_start(),
        }
    }
}

pub struct ChangeDetector {
    coordinator: Arc<ImportCoordinator>,
    stations: Vec<StationDir>,
    config: WatcherConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeDetector {
    pub fn new(
        coordinator: Arc<ImportCoordinator>,
        stations: Vec<StationDir>,
        config: WatcherConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            coordinator,
            stations,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn stations(&self) -> &[StationDir] {
        &self.stations
    }

    /// Spawn one supervised watch per station
    pub fn start(self: &Arc<Self>) {
        self.shutdown.send_replace(false);

        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "Watcher task list lock poisoned");
                return;
            }
        };
        if !tasks.is_empty() {
            return;
        }

        for station in &self.stations {
            let this = Arc::clone(self);
            let station = station.clone();
            tasks.push(tokio::spawn(async move { this.supervise(station).await }));
        }

        tracing::info!(stations = self.stations.len(), "Change detector started");
    }

    /// Stop all watches and wait for their tasks
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Watch task ended abnormally");
            }
        }
        tracing::info!("Change detector stopped");
    }

    async fn supervise(self: Arc<Self>, station: StationDir) {
        let mut shutdown = self.shutdown.subscribe();
        let restart_delay = Duration::from_millis(self.config.restart_delay_ms);
        let mut scanned = false;

        loop {
            if *shutdown.borrow() {
                return;
            }

            if self.config.scan_on_start && !scanned && station.directory.is_dir() {
                self.scan(&station);
                scanned = true;
            }

            match self.watch_station(&station, &mut shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        station = %station.name,
                        directory = %station.directory.display(),
                        error = %e,
                        restart_in_ms = restart_delay.as_millis() as u64,
                        "Watch failed, restarting"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(restart_delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    fn scan(&self, station: &StationDir) {
        match self
            .coordinator
            .submit_directory(&station.name, &station.directory, Priority::Normal)
        {
            Ok(ids) => tracing::info!(
                station = %station.name,
                files = ids.len(),
                "Submitted existing files"
            ),
            Err(e) => tracing::warn!(
                station = %station.name,
                error = %e,
                "Startup scan failed"
            ),
        }
    }

    /// Runs until shutdown (`Ok`) or until the watch breaks (`Err`)
    async fn watch_station(
        &self,
        station: &StationDir,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WatchResult<()> {
        if !station.directory.is_dir() {
            return Err(WatchError::DirectoryMissing(station.directory.clone()));
        }

        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(256);
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            // callback runs on notify's own thread
            let _ = tx.blocking_send(res);
        })?;
        watcher.watch(&station.directory, RecursiveMode::NonRecursive)?;

        tracing::info!(
            station = %station.name,
            directory = %station.directory.display(),
            "Watching station directory"
        );

        let mut debouncer = Debouncer::new(Duration::from_millis(self.config.debounce_ms));

        loop {
            let deadline = debouncer.next_deadline();

            tokio::select! {
                received = rx.recv() => match received {
                    Some(Ok(event)) => {
                        if is_write_event(&event.kind) {
                            let now = tokio::time::Instant::now();
                            for path in event.paths.iter().filter(|p| self.coordinator.matches_extension(p)) {
                                tracing::trace!(station = %station.name, file = %path.display(), "File event");
                                debouncer.touch(path, now);
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(WatchError::StreamClosed(station.directory.clone())),
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    for path in debouncer.take_due(tokio::time::Instant::now()) {
                        self.submit(station, path);
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn submit(&self, station: &StationDir, path: PathBuf) {
        if !path.is_file() {
            tracing::debug!(station = %station.name, file = %path.display(), "File vanished before settling");
            return;
        }
        match self.coordinator.submit(&station.name, &path, Priority::Normal) {
            Ok(job) => tracing::debug!(
                station = %station.name,
                file = %path.display(),
                job = %job,
                "Change submitted"
            ),
            Err(e) => tracing::warn!(
                station = %station.name,
                file = %path.display(),
                error = %e,
                "Failed to submit changed file"
            ),
        }
    }
}

fn is_write_event(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::ingest::{ProcessorConfig, RowProcessor};
    use crate::storage::MeasurementStore;
    use notify::event::{CreateKind, ModifyKind};
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> Arc<ImportCoordinator> {
        let store = Arc::new(MeasurementStore::open(dir.join("store.db")).unwrap());
        let processor = Arc::new(RowProcessor::new(store, ProcessorConfig::default()));
        Arc::new(ImportCoordinator::new(processor, CoordinatorConfig::default()))
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            debounce_ms: 50,
            restart_delay_ms: 50,
            scan_on_start: true,
        }
    }

    async fn wait_for_submissions(coordinator: &ImportCoordinator, expected: u64) -> u64 {
        for _ in 0..100 {
            let submitted = coordinator.snapshot().unwrap().totals.submitted;
            if submitted >= expected {
                return submitted;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        coordinator.snapshot().unwrap().totals.submitted
    }

    #[test]
    fn test_write_event_kinds() {
        assert!(is_write_event(&EventKind::Create(CreateKind::File)));
        assert!(is_write_event(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_write_event(&EventKind::Access(notify::event::AccessKind::Any)));
    }

    #[tokio::test]
    async fn test_scan_on_start_submits_backlog() {
        let dir = tempdir().unwrap();
        let station_dir = dir.path().join("ort");
        std::fs::create_dir(&station_dir).unwrap();
        std::fs::write(station_dir.join("a.csv"), "Systemzeit;LAeq\n").unwrap();
        std::fs::write(station_dir.join("b.csv"), "Systemzeit;LAeq\n").unwrap();

        let coordinator = setup(dir.path());
        let detector = Arc::new(ChangeDetector::new(
            Arc::clone(&coordinator),
            vec![StationDir {
                name: "ort".to_string(),
                directory: station_dir,
            }],
            fast_config(),
        ));

        detector.start();
        assert_eq!(wait_for_submissions(&coordinator, 2).await, 2);
        detector.stop().await;
    }

    #[tokio::test]
    async fn test_burst_of_appends_submits_once() {
        use std::io::Write;

        let dir = tempdir().unwrap();
        let station_dir = dir.path().join("ort");
        std::fs::create_dir(&station_dir).unwrap();

        let coordinator = setup(dir.path());
        let detector = Arc::new(ChangeDetector::new(
            Arc::clone(&coordinator),
            vec![StationDir {
                name: "ort".to_string(),
                directory: station_dir.clone(),
            }],
            WatcherConfig {
                debounce_ms: 300,
                restart_delay_ms: 50,
                scan_on_start: false,
            },
        ));
        coordinator.start();
        detector.start();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let path = station_dir.join("a.csv");
        std::fs::write(&path, "Datum;Systemzeit;LAeq\n").unwrap();
        for i in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "09.03.2024;10:00:0{};5{}", i, i).unwrap();
        }

        // still settling
        assert_eq!(coordinator.snapshot().unwrap().totals.submitted, 0);

        assert_eq!(wait_for_submissions(&coordinator, 1).await, 1);
        for _ in 0..100 {
            if coordinator.snapshot().unwrap().totals.completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let totals = coordinator.snapshot().unwrap().totals;
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.rows_inserted, 5);
        assert!(crate::ingest::sidecar_path(&path).exists());

        // checkpoint side-car writes and foreign files settle without a job
        std::fs::write(station_dir.join("notes.txt"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(coordinator.snapshot().unwrap().totals.submitted, 1);

        detector.stop().await;
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_missing_directory_is_retried() {
        let dir = tempdir().unwrap();
        let station_dir = dir.path().join("late");

        let coordinator = setup(dir.path());
        let detector = Arc::new(ChangeDetector::new(
            Arc::clone(&coordinator),
            vec![StationDir {
                name: "late".to_string(),
                directory: station_dir.clone(),
            }],
            fast_config(),
        ));
        detector.start();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        std::fs::write(staging.join("first.csv"), "Systemzeit;LAeq\n").unwrap();
        std::fs::rename(&staging, &station_dir).unwrap();

        // picked up by the startup scan once the directory exists
        assert_eq!(wait_for_submissions(&coordinator, 1).await, 1);
        detector.stop().await;
    }
}
