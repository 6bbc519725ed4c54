pub mod config;
pub mod error;
pub mod job;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod store;

pub use config::QueueConfig;
pub use error::{DurationError, QueueError, RunnerError, StoreError};
pub use job::{JobId, JobRecord, JobStatus};
pub use queue::{JobEdit, JobQueue, QueueEvent, RunMode};
pub use runner::{CommandRunner, FailureReason, Outcome, ProcessRunner, RunEvent, RunId, RunnerEvent};
pub use store::{JobStore, PersistedJob};
