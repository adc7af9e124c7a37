use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Station directory missing: {0:?}")]
    DirectoryMissing(PathBuf),

    #[error("Event stream closed for {0:?}")]
    StreamClosed(PathBuf),
}

pub type WatchResult<T> = Result<T, WatchError>;
