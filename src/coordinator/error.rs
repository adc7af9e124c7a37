//! Coordinator error types

use crate::coordinator::job::{JobId, JobStatus};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Submitted file does not exist
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    /// Submitted directory does not exist
    #[error("Directory missing: {0:?}")]
    DirectoryMissing(PathBuf),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Only queued jobs can be cancelled
    #[error("Job {id} is {status} and cannot be cancelled")]
    NotCancellable { id: JobId, status: JobStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Coordinator stopped before job {0} finished")]
    Stopped(JobId),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
