//! Coordinator events
//!
//! Published on a broadcast channel; slow subscribers lag and lose the
//! oldest events rather than blocking job execution.

use crate::coordinator::job::{JobId, Priority};
use crate::ingest::FileOutcome;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportEvent {
    Queued {
        job_id: JobId,
        station: String,
        file: String,
        priority: Priority,
    },
    Started {
        job_id: JobId,
        station: String,
        file: String,
    },
    Progress {
        job_id: JobId,
        rows: u64,
    },
    Completed {
        job_id: JobId,
        outcome: FileOutcome,
    },
    Failed {
        job_id: JobId,
        station: String,
        file: String,
        error: String,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl ImportEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            ImportEvent::Queued { job_id, .. }
            | ImportEvent::Started { job_id, .. }
            | ImportEvent::Progress { job_id, .. }
            | ImportEvent::Completed { job_id, .. }
            | ImportEvent::Failed { job_id, .. }
            | ImportEvent::Cancelled { job_id } => *job_id,
        }
    }

    /// Whether the job reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportEvent::Completed { .. } | ImportEvent::Failed { .. } | ImportEvent::Cancelled { .. }
        )
    }
}
