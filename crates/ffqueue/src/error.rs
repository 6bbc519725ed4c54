use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobId;

/// Errors returned synchronously by [`crate::runner::ProcessRunner::start`]
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("a command is already running")]
    Busy,

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by queue operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("an identical command line is already queued as job {0}")]
    DuplicateJob(JobId),

    #[error("job {existing} already writes to {}", output.display())]
    OutputConflict {
        existing: JobId,
        index: usize,
        output: PathBuf,
    },

    #[error("no job with id {0}")]
    UnknownJob(JobId),

    #[error("job {0} is not waiting")]
    NotWaiting(JobId),

    #[error("another job is running")]
    Busy,
}

/// Failure to parse a `[-]HH:MM:SS` duration string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurationError {
    #[error("expected [-]HH:MM:SS, got '{0}'")]
    Format(String),

    #[error("invalid number '{field}' in duration '{input}'")]
    Number { input: String, field: String },
}

/// Errors reading or writing the persisted job list
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read job list '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write job list '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse job list '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported job list version {0}")]
    Version(u32),

    #[error("failed to encode job list: {0}")]
    Encode(#[from] serde_json::Error),
}
