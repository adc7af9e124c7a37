//! Priority queue of job ids
//!
//! Higher priority first; equal priorities leave in submission order.

use crate::coordinator::job::{JobId, Priority};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: JobId,
    pub priority: Priority,
    seq: u64,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: JobId, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob { id, priority, seq });
    }

    /// Put back an entry taken with [`pop`](Self::pop), keeping its place
    pub fn restore(&mut self, job: QueuedJob) {
        self.heap.push(job);
    }

    pub fn pop(&mut self) -> Option<QueuedJob> {
        self.heap.pop()
    }

    pub fn remove(&mut self, id: JobId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|job| job.id != id);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Ids in dispatch order
    pub fn ordered(&self) -> Vec<JobId> {
        let mut jobs: Vec<QueuedJob> = self.heap.iter().copied().collect();
        jobs.sort_by(|a, b| b.cmp(a));
        jobs.into_iter().map(|j| j.id).collect()
    }
}
