use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// An invocation exceeded its time budget and was aborted
    #[error("Job {job} timed out after {timeout:?}")]
    Timeout { job: String, timeout: Duration },

    /// The task itself reported a failure
    #[error("Job {job} failed: {message}")]
    Failed { job: String, message: String },

    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
