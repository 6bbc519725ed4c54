use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::progress;
use crate::runner::Outcome;

/// Sequence number of a job, assigned at insertion and never reused by the same queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Running,
    Finished,
    Error,
}

impl JobStatus {
    /// FINISHED and ERROR need explicit user action to change
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "Waiting"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Finished => write!(f, "Finished"),
            JobStatus::Error => write!(f, "Error"),
        }
    }
}

/// One encode job: a single source/output pair and the command that produces it
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    /// Length of the source as `[-]HH:MM:SS`
    pub duration: String,
    /// `duration` in seconds; 0 when it could not be parsed
    pub duration_secs: i64,
    command: String,
    status: JobStatus,
    log: String,
    percent: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a waiting job. The duration is parsed once here.
    pub fn new(
        id: JobId,
        source_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        duration: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        let duration = duration.into();
        let duration_secs = match progress::parse_duration(&duration) {
            Ok(secs) => secs,
            Err(e) => {
                log::debug!("Job {}: {}; progress will read 0%", id, e);
                0
            }
        };

        Self {
            id,
            source_path: source_path.into(),
            output_path: output_path.into(),
            duration,
            duration_secs,
            command: command.into(),
            status: JobStatus::Waiting,
            log: String::new(),
            percent: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Everything the tool printed during the last attempt
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Last reported progress, for display only
    pub fn percent(&self) -> u32 {
        self.percent
    }

    /// Name shown in job lists: the output file name
    pub fn display_name(&self) -> String {
        file_name_or_path(&self.output_path)
    }

    /// WAITING -> RUNNING. Starts a fresh log for this attempt.
    pub(crate) fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.log.clear();
        self.percent = 0;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    /// WAITING -> ERROR without a running interval (the command never spawned)
    pub(crate) fn mark_spawn_failed(&mut self, message: &str) {
        self.log.clear();
        self.log.push_str(message);
        self.status = JobStatus::Error;
        self.percent = 0;
        self.started_at = None;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn append_log(&mut self, text: &str) {
        self.log.push_str(text);
    }

    /// Store progress for `elapsed` seconds and return the derived percentage
    pub(crate) fn record_progress(&mut self, elapsed: i64) -> u32 {
        self.percent = progress::percent(elapsed, self.duration_secs);
        self.percent
    }

    /// Apply a runner outcome: RUNNING -> FINISHED | ERROR | WAITING
    pub(crate) fn apply_outcome(&mut self, outcome: &Outcome) -> JobStatus {
        self.status = match outcome {
            Outcome::Success => {
                self.percent = 100;
                JobStatus::Finished
            }
            Outcome::Failed(_) => JobStatus::Error,
            Outcome::Aborted => {
                self.percent = 0;
                JobStatus::Waiting
            }
        };

        if self.status.is_terminal() {
            self.finished_at = Some(Utc::now());
        } else {
            self.started_at = None;
        }
        self.status
    }
}

fn file_name_or_path(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FailureReason;

    fn job() -> JobRecord {
        JobRecord::new(JobId(1), "/in/a.mkv", "/out/a.mp4", "00:02:00", "ffmpeg -i a.mkv a.mp4")
    }

    #[test]
    fn test_new_job_is_waiting_with_parsed_duration() {
        let j = job();
        assert_eq!(j.status(), JobStatus::Waiting);
        assert_eq!(j.duration_secs, 120);
        assert_eq!(j.display_name(), "a.mp4");
        assert!(j.log().is_empty());
    }

    #[test]
    fn test_status_and_id_text() {
        // `ffq list` prints statuses and ids as text, in the table and in JSON
        let text: Vec<String> = [JobStatus::Waiting, JobStatus::Running, JobStatus::Finished, JobStatus::Error]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(text, vec!["Waiting", "Running", "Finished", "Error"]);
        assert_eq!(JobId(12).to_string(), "12");
    }

    #[test]
    fn test_unparsable_duration_is_zero() {
        let j = JobRecord::new(JobId(2), "a", "b", "N/A", "cmd");
        assert_eq!(j.duration_secs, 0);
    }

    #[test]
    fn test_progress_and_success() {
        let mut j = job();
        j.mark_running();
        j.append_log("frame=1 time=00:01:00.00\n");
        assert_eq!(j.record_progress(60), 50);
        assert_eq!(j.apply_outcome(&Outcome::Success), JobStatus::Finished);
        assert!(j.finished_at.is_some());
        assert_eq!(j.log(), "frame=1 time=00:01:00.00\n");
    }

    #[test]
    fn test_failure_keeps_log() {
        let mut j = job();
        j.mark_running();
        j.append_log("Error while decoding stream");
        let status = j.apply_outcome(&Outcome::Failed(FailureReason::ExitCode(Some(1))));
        assert_eq!(status, JobStatus::Error);
        assert!(j.log().contains("Error while decoding"));
    }

    #[test]
    fn test_abort_requeues() {
        let mut j = job();
        j.mark_running();
        j.record_progress(90);
        assert_eq!(j.apply_outcome(&Outcome::Aborted), JobStatus::Waiting);
        assert_eq!(j.percent(), 0);
        assert!(j.started_at.is_none());
    }

    #[test]
    fn test_new_attempt_starts_fresh_log() {
        let mut j = job();
        j.mark_running();
        j.append_log("first attempt");
        j.apply_outcome(&Outcome::Aborted);
        j.mark_running();
        assert!(j.log().is_empty());
    }

    #[test]
    fn test_spawn_failure_goes_straight_to_error() {
        let mut j = job();
        j.mark_spawn_failed("No such file or directory");
        assert_eq!(j.status(), JobStatus::Error);
        assert!(j.started_at.is_none());
        assert_eq!(j.log(), "No such file or directory");
    }
}
