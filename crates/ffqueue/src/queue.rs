//! Job list and the scheduler that feeds it to a [`CommandRunner`].
//!
//! The queue owns every [`JobRecord`]. It starts jobs on the runner and is
//! the only consumer of the runner's events, so all record mutation happens
//! in [`JobQueue::handle_runner_event`] or in the synchronous edit
//! operations. Observers (a UI, the headless CLI) follow along through the
//! [`QueueEvent`] channel returned by [`JobQueue::new`].

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::error::{QueueError, RunnerError, StoreError};
use crate::job::{JobId, JobRecord, JobStatus};
use crate::runner::{CommandRunner, FailureReason, Outcome, ProcessRunner, RunEvent, RunId, RunnerEvent};
use crate::store::{JobStore, PersistedJob};

/// What the scheduler does after a job reaches a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Idle,
    /// Keep starting the first WAITING job until none is left
    Batch,
    /// Run exactly this job, then go idle
    Single(JobId),
}

/// Replacement fields for [`JobQueue::edit`]; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct JobEdit {
    pub source: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub duration: Option<String>,
    pub command: Option<String>,
}

/// Notifications for whoever displays the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    JobSelectedChanged { index: Option<usize> },
    ProgressUpdated { job: JobId, percent: u32 },
    JobFinished { job: JobId, outcome: Outcome },
    QueueCountChanged { count: usize },
    /// A batch or single run ended; `completed` jobs reached FINISHED or ERROR
    RunFinished { completed: usize },
}

#[derive(Debug, Clone, Copy)]
struct ActiveRun {
    job: JobId,
    run: RunId,
}

pub struct JobQueue<R: CommandRunner = ProcessRunner> {
    runner: R,
    jobs: Vec<JobRecord>,
    next_id: u64,
    selected: Option<usize>,
    mode: RunMode,
    active: Option<ActiveRun>,
    completed: usize,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl<R: CommandRunner> JobQueue<R> {
    pub fn new(runner: R) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            runner,
            jobs: Vec::new(),
            next_id: 1,
            selected: None,
            mode: RunMode::Idle,
            active: None,
            completed: 0,
            events: tx,
        };
        (queue, rx)
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn index_of(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    /// Accumulated output of the job's last attempt
    pub fn log(&self, id: JobId) -> Option<&str> {
        self.job(id).map(JobRecord::log)
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// True while a mode is active or a cancelled run has not reported back yet
    pub fn is_running(&self) -> bool {
        self.mode != RunMode::Idle || self.active.is_some()
    }

    pub fn running_job(&self) -> Option<JobId> {
        self.active.map(|a| a.job)
    }

    pub fn count_finished(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status() == JobStatus::Finished)
            .count()
    }

    /// Position of the job writing to `output`
    pub fn index_of_output(&self, output: &Path) -> Option<usize> {
        self.jobs.iter().position(|j| j.output_path == output)
    }

    /// Add a WAITING job at the end of the list.
    ///
    /// The same command line may be queued only once, and no two jobs may
    /// write the same output file. Either conflict leaves the queue untouched.
    pub fn submit(
        &mut self,
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        duration: impl Into<String>,
        command: impl Into<String>,
    ) -> Result<JobId, QueueError> {
        let command = command.into();
        let output = output.into();

        if let Some(existing) = self.jobs.iter().find(|j| j.command() == command) {
            debug!("Command already queued as job {}", existing.id);
            return Err(QueueError::DuplicateJob(existing.id));
        }
        if let Some(index) = self.index_of_output(&output) {
            return Err(QueueError::OutputConflict {
                existing: self.jobs[index].id,
                index,
                output,
            });
        }

        let id = JobId(self.next_id);
        self.next_id += 1;
        self.jobs.push(JobRecord::new(id, source, output, duration, command));
        info!("Queued job {}", id);

        if self.selected.is_none() {
            self.set_selected(Some(self.jobs.len() - 1));
        }
        self.emit_count();
        Ok(id)
    }

    /// Run every WAITING job in list order. No-op while a run is active.
    pub fn start_all(&mut self) {
        if self.mode != RunMode::Idle {
            debug!("start_all ignored, already in {:?} mode", self.mode);
            return;
        }
        info!("Starting all waiting jobs");
        self.mode = RunMode::Batch;
        self.completed = 0;
        self.advance();
    }

    /// Run only job `id`
    pub fn start_one(&mut self, id: JobId) -> Result<(), QueueError> {
        let index = self.index_of(id).ok_or(QueueError::UnknownJob(id))?;
        if self.mode != RunMode::Idle {
            return Err(QueueError::Busy);
        }
        if self.jobs[index].status() != JobStatus::Waiting {
            return Err(QueueError::NotWaiting(id));
        }
        info!("Starting job {}", id);
        self.mode = RunMode::Single(id);
        self.completed = 0;
        self.advance();
        Ok(())
    }

    /// Stop the running job and the current mode.
    ///
    /// The job goes back to WAITING once the runner reports the abort.
    pub fn abort(&mut self) {
        if !self.is_running() {
            debug!("abort ignored, nothing is running");
            return;
        }
        self.mode = RunMode::Idle;
        self.completed = 0;
        if let Some(active) = self.active {
            info!("Aborting job {}", active.job);
            self.runner.cancel();
        }
    }

    /// Delete job `id`, aborting it first when it is running
    pub fn remove(&mut self, id: JobId) -> Result<JobRecord, QueueError> {
        let index = self.index_of(id).ok_or(QueueError::UnknownJob(id))?;
        if self.running_job() == Some(id) {
            self.abort();
            // its outcome is stale from here on
            self.active = None;
        }
        Ok(self.remove_at(index))
    }

    /// Take a job out of the queue so its command can be rebuilt and resubmitted
    pub fn take_for_edit(&mut self, id: JobId) -> Result<JobRecord, QueueError> {
        let index = self.index_of(id).ok_or(QueueError::UnknownJob(id))?;
        if self.jobs[index].status() == JobStatus::Running {
            return Err(QueueError::Busy);
        }
        Ok(self.remove_at(index))
    }

    /// Rebuild a job that is not running. It keeps its row but gets a fresh id
    /// and starts over as WAITING. A rejected edit puts the old job back untouched.
    pub fn edit(&mut self, id: JobId, edit: JobEdit) -> Result<JobId, QueueError> {
        let index = self.index_of(id).ok_or(QueueError::UnknownJob(id))?;
        let selected = self.selected;
        let old = self.take_for_edit(id)?;

        let submitted = self.submit(
            edit.source.unwrap_or_else(|| old.source_path.clone()),
            edit.output.unwrap_or_else(|| old.output_path.clone()),
            edit.duration.unwrap_or_else(|| old.duration.clone()),
            edit.command.unwrap_or_else(|| old.command().to_string()),
        );
        match submitted {
            Ok(new_id) => {
                if let Some(job) = self.jobs.pop() {
                    self.jobs.insert(index, job);
                }
                self.selected = None;
                self.set_selected(Some(index));
                info!("Job {} edited, now job {}", id, new_id);
                Ok(new_id)
            }
            Err(e) => {
                debug!("Edit of job {} rejected: {}", id, e);
                self.jobs.insert(index.min(self.jobs.len()), old);
                self.selected = None;
                self.set_selected(selected);
                self.emit_count();
                Err(e)
            }
        }
    }

    pub fn remove_all(&mut self) {
        if self.is_running() {
            self.abort();
            self.active = None;
        }
        self.jobs.clear();
        self.set_selected(None);
        self.emit_count();
    }

    /// Drop every FINISHED job
    pub fn clear_finished(&mut self) {
        let keep = self.selected_job().map(|j| j.id);
        let before = self.jobs.len();
        self.jobs.retain(|j| j.status() != JobStatus::Finished);
        if self.jobs.len() == before {
            return;
        }

        let selected = keep
            .and_then(|id| self.index_of(id))
            .or(if self.jobs.is_empty() { None } else { Some(0) });
        self.selected = None;
        self.set_selected(selected);
        self.emit_count();
    }

    /// Swap job `id` with the one above it. Returns false at the top.
    pub fn move_up(&mut self, id: JobId) -> Result<bool, QueueError> {
        let index = self.index_of(id).ok_or(QueueError::UnknownJob(id))?;
        if index == 0 {
            return Ok(false);
        }
        self.jobs.swap(index, index - 1);
        self.set_selected(Some(index - 1));
        Ok(true)
    }

    /// Swap job `id` with the one below it. Returns false at the bottom.
    pub fn move_down(&mut self, id: JobId) -> Result<bool, QueueError> {
        let index = self.index_of(id).ok_or(QueueError::UnknownJob(id))?;
        if index + 1 >= self.jobs.len() {
            return Ok(false);
        }
        self.jobs.swap(index, index + 1);
        self.set_selected(Some(index + 1));
        Ok(true)
    }

    /// Select the row at `index`; out of range indices are ignored
    pub fn select(&mut self, index: Option<usize>) {
        match index {
            Some(i) if i >= self.jobs.len() => debug!("Ignoring selection of row {}", i),
            _ => self.set_selected(index),
        }
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn selected_job(&self) -> Option<&JobRecord> {
        self.selected.and_then(|i| self.jobs.get(i))
    }

    /// Short status line for a window title
    pub fn title(&self) -> String {
        let Some(job) = self.running_job().and_then(|id| self.job(id)) else {
            return "Job manager".to_string();
        };
        match self.mode {
            RunMode::Batch => {
                // counts only this batch: done so far plus the running and waiting jobs
                let remaining = self
                    .jobs
                    .iter()
                    .filter(|j| matches!(j.status(), JobStatus::Waiting | JobStatus::Running))
                    .count();
                format!(
                    "Job ({}/{}): {}%",
                    self.completed + 1,
                    self.completed + remaining,
                    job.percent()
                )
            }
            _ => format!("Job {}: {}%", job.id, job.percent()),
        }
    }

    /// Apply one event from the runner
    pub fn handle_runner_event(&mut self, event: RunnerEvent) {
        let current = self
            .active
            .filter(|a| a.run == event.run)
            .and_then(|a| self.index_of(a.job).map(|index| (a.job, index)));

        let Some((id, index)) = current else {
            if let RunEvent::Outcome(outcome) = event.event {
                debug!("Run {} ended ({}) after being discarded", event.run, outcome);
                // the runner is free again; a deferred start can go ahead
                self.advance();
            }
            return;
        };

        match event.event {
            RunEvent::Chunk { text, .. } => self.jobs[index].append_log(&text),
            RunEvent::Progress { seconds } => {
                let percent = self.jobs[index].record_progress(seconds);
                self.emit(QueueEvent::ProgressUpdated { job: id, percent });
            }
            RunEvent::Outcome(outcome) => {
                self.active = None;
                let status = self.jobs[index].apply_outcome(&outcome);
                match &outcome {
                    Outcome::Success => info!("Job {} finished", id),
                    Outcome::Failed(reason) => warn!("Job {} failed: {}", id, reason),
                    Outcome::Aborted => info!("Job {} aborted, back to {}", id, status),
                }
                if status.is_terminal() {
                    self.completed += 1;
                }
                self.emit(QueueEvent::JobFinished { job: id, outcome });
                self.advance();
            }
        }
    }

    /// Feed runner events into the queue until it goes idle
    pub async fn drive(&mut self, events: &mut mpsc::UnboundedReceiver<RunnerEvent>) {
        while self.is_running() {
            match events.recv().await {
                Some(event) => self.handle_runner_event(event),
                None => {
                    warn!("Runner event stream closed with work outstanding");
                    break;
                }
            }
        }
    }

    /// Every job that has not FINISHED, in list order
    pub fn snapshot(&self) -> Vec<PersistedJob> {
        self.jobs
            .iter()
            .filter(|j| j.status() != JobStatus::Finished)
            .map(|j| PersistedJob {
                source: j.source_path.clone(),
                output: j.output_path.clone(),
                duration: j.duration.clone(),
                command: j.command().to_string(),
            })
            .collect()
    }

    /// Append saved jobs as WAITING with fresh ids. Returns how many were added.
    pub fn restore(&mut self, saved: Vec<PersistedJob>) -> usize {
        let mut added = 0;
        for job in saved {
            match self.submit(job.source, job.output, job.duration, job.command) {
                Ok(_) => added += 1,
                Err(e) => warn!("Skipping saved job: {}", e),
            }
        }
        added
    }

    pub fn persist(&self, store: &JobStore) -> Result<usize, StoreError> {
        let saved = self.snapshot();
        store.save(&saved)?;
        Ok(saved.len())
    }

    pub fn load(&mut self, store: &JobStore) -> Result<usize, StoreError> {
        let saved = store.load()?;
        Ok(self.restore(saved))
    }

    /// Start the next job for the current mode, or end the mode when there is none
    fn advance(&mut self) {
        loop {
            if self.active.is_some() {
                return;
            }
            let Some(index) = self.next_index() else {
                self.finish_run();
                return;
            };
            if !self.launch(index) {
                return;
            }
        }
    }

    fn next_index(&self) -> Option<usize> {
        let waiting = |i: &usize| self.jobs[*i].status() == JobStatus::Waiting;
        match self.mode {
            RunMode::Idle => None,
            RunMode::Batch => (0..self.jobs.len()).find(waiting),
            RunMode::Single(_) if self.completed > 0 => None,
            RunMode::Single(id) => self.index_of(id).filter(waiting),
        }
    }

    /// Start the job at `index`. Returns false when the start has to wait
    /// for the runner to become free.
    fn launch(&mut self, index: usize) -> bool {
        let id = self.jobs[index].id;
        match self.runner.start(self.jobs[index].command()) {
            Ok(run) => {
                debug!("Job {} running as run {}", id, run);
                self.jobs[index].mark_running();
                self.active = Some(ActiveRun { job: id, run });
                true
            }
            Err(RunnerError::Busy) => {
                debug!("Runner busy, job {} waits for the previous run to end", id);
                false
            }
            Err(e) => {
                warn!("Job {} could not start: {}", id, e);
                let message = e.to_string();
                self.jobs[index].mark_spawn_failed(&message);
                self.completed += 1;
                self.emit(QueueEvent::JobFinished {
                    job: id,
                    outcome: Outcome::Failed(FailureReason::Spawn(message)),
                });
                true
            }
        }
    }

    fn finish_run(&mut self) {
        if self.mode == RunMode::Idle {
            return;
        }
        let completed = std::mem::replace(&mut self.completed, 0);
        self.mode = RunMode::Idle;
        info!("Run finished, {} job(s) completed", completed);
        self.emit(QueueEvent::RunFinished { completed });
    }

    fn remove_at(&mut self, index: usize) -> JobRecord {
        let removed = self.jobs.remove(index);
        info!("Removed job {}", removed.id);

        let selected = self.selected;
        match selected {
            Some(sel) if sel == index => {
                let next = if self.jobs.is_empty() {
                    None
                } else {
                    Some(index.min(self.jobs.len() - 1))
                };
                // a different row may now sit at the same position
                self.selected = None;
                self.set_selected(next);
            }
            Some(sel) if sel > index => self.set_selected(Some(sel - 1)),
            _ => {}
        }
        self.emit_count();
        removed
    }

    fn set_selected(&mut self, index: Option<usize>) {
        if self.selected != index {
            self.selected = index;
            self.emit(QueueEvent::JobSelectedChanged { index });
        }
    }

    fn emit_count(&self) {
        self.emit(QueueEvent::QueueCountChanged {
            count: self.jobs.len(),
        });
    }

    fn emit(&self, event: QueueEvent) {
        if self.events.send(event).is_err() {
            debug!("Queue event receiver dropped");
        }
    }
}
