//! Settle-window debouncing of file events
//!
//! Every event for a path pushes its deadline out by the settle window; a
//! path is released once no event arrived for that long.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Debouncer {
    settle: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            pending: HashMap::new(),
        }
    }

    /// Record an event for `path` at `now`
    pub fn touch(&mut self, path: &Path, now: Instant) {
        self.pending.insert(path.to_path_buf(), now + self.settle);
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return paths that settled by `now`, sorted
    pub fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.pending.remove(path);
        }
        due.sort();
        due
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_coalesces_into_one_release() {
        let mut debouncer = Debouncer::new(Duration::from_millis(1500));
        let start = Instant::now();
        let file = Path::new("/data/ort/a.csv");

        for ms in [0, 400, 800, 1200] {
            debouncer.touch(file, start + Duration::from_millis(ms));
        }
        assert_eq!(debouncer.len(), 1);

        assert!(debouncer.take_due(start + Duration::from_millis(2000)).is_empty());
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(2700))
        );

        let due = debouncer.take_due(start + Duration::from_millis(2700));
        assert_eq!(due, vec![file.to_path_buf()]);
        assert!(debouncer.is_empty());
        assert!(debouncer.next_deadline().is_none());
    }

    #[test]
    fn test_independent_paths() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();
        debouncer.touch(Path::new("b.csv"), start);
        debouncer.touch(Path::new("a.csv"), start);
        debouncer.touch(Path::new("c.csv"), start + Duration::from_millis(50));

        let due = debouncer.take_due(start + Duration::from_millis(100));
        assert_eq!(due, vec![PathBuf::from("a.csv"), PathBuf::from("b.csv")]);
        assert_eq!(debouncer.len(), 1);
    }
}
