use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ffqueue::{
    probe, progress, JobEdit, JobId, JobQueue, JobStatus, JobStore, ProcessRunner, QueueConfig, QueueError,
    QueueEvent,
};
use log::{debug, info, warn, LevelFilter};
use serde::Serialize;
use std::path::PathBuf;

/// Headless ffmpeg job queue
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a command line that turns SOURCE into OUTPUT
    Add {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Source length as HH:MM:SS; probed with ffprobe when omitted
        #[arg(long)]
        duration: Option<String>,

        /// The full shell command line
        command: String,
    },
    /// Show the queued jobs
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Rebuild a job that is not running; it gets a new id and waits again
    Edit {
        id: u64,

        #[arg(long)]
        source: Option<PathBuf>,

        #[arg(long)]
        output: Option<PathBuf>,

        /// New source length as HH:MM:SS
        #[arg(long)]
        duration: Option<String>,

        /// The new command line; the old one is kept when omitted
        command: Option<String>,
    },
    /// Remove one job
    Remove { id: u64 },
    /// Remove every job
    Clear,
    /// Move a job one place up
    Up { id: u64 },
    /// Move a job one place down
    Down { id: u64 },
    /// Print the duration ffprobe reports for a file
    Probe { file: PathBuf },
    /// Run the waiting jobs in order, or just one with --job
    Run {
        #[arg(long)]
        job: Option<u64>,

        /// Print the output of failed jobs when the run ends
        #[arg(long)]
        show_log: bool,
    },
}

#[derive(Serialize)]
struct ListEntry<'a> {
    id: u64,
    status: String,
    source: &'a std::path::Path,
    output: &'a std::path::Path,
    duration: &'a str,
    command: &'a str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG applies unless --verbose asks for debug output
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.format_timestamp_secs().init();

    let cfg = QueueConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    debug!("Job list: {}", cfg.state_file.display());

    let store = JobStore::new(&cfg.state_file);
    let (runner, mut runner_events) = ProcessRunner::new(&cfg);
    let (mut queue, mut queue_events) = JobQueue::new(runner);
    queue
        .load(&store)
        .with_context(|| format!("Failed to load job list from {}", store.path().display()))?;

    match args.command {
        Commands::Add {
            source,
            output,
            duration,
            command,
        } => {
            let duration = match duration {
                Some(d) => {
                    progress::parse_duration(&d).with_context(|| format!("Invalid duration: {}", d))?;
                    d
                }
                None => match probe::probe_duration(&cfg, &source).await? {
                    Some(secs) => progress::format_duration(secs),
                    None => {
                        warn!("No duration for {}, progress will stay at 0%", source.display());
                        progress::format_duration(0)
                    }
                },
            };

            match queue.submit(source, output, duration, command) {
                Ok(id) => println!("Queued job {}", id),
                Err(QueueError::DuplicateJob(id)) => println!("Already queued as job {}", id),
                Err(QueueError::OutputConflict { existing, index, output }) => {
                    anyhow::bail!(
                        "Job {} (row {}) already writes to {}",
                        existing,
                        index + 1,
                        output.display()
                    );
                }
                Err(e) => return Err(e.into()),
            }
            queue.persist(&store)?;
        }
        Commands::List { json } => {
            if json {
                let entries: Vec<ListEntry> = queue
                    .jobs()
                    .iter()
                    .map(|j| ListEntry {
                        id: j.id.0,
                        status: j.status().to_string(),
                        source: &j.source_path,
                        output: &j.output_path,
                        duration: &j.duration,
                        command: j.command(),
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if queue.is_empty() {
                println!("No jobs in {}", store.path().display());
            } else {
                println!("{:>4}  {:<8}  {:<9}  {}", "ID", "STATUS", "DURATION", "OUTPUT");
                for job in queue.jobs() {
                    println!(
                        "{:>4}  {:<8}  {:<9}  {}",
                        job.id.0,
                        job.status().to_string(),
                        job.duration,
                        job.output_path.display()
                    );
                }
            }
        }
        Commands::Edit {
            id,
            source,
            output,
            duration,
            command,
        } => {
            if let Some(d) = &duration {
                progress::parse_duration(d).with_context(|| format!("Invalid duration: {}", d))?;
            }
            let edit = JobEdit {
                source,
                output,
                duration,
                command,
            };
            let new_id = queue
                .edit(JobId(id), edit)
                .with_context(|| format!("Failed to edit job {}", id))?;
            println!("Job {} is now job {}", id, new_id);
            queue.persist(&store)?;
        }
        Commands::Remove { id } => {
            let job = queue.remove(JobId(id))?;
            println!("Removed job {} ({})", id, job.display_name());
            queue.persist(&store)?;
        }
        Commands::Clear => {
            let count = queue.len();
            queue.remove_all();
            println!("Removed {} job(s)", count);
            queue.persist(&store)?;
        }
        Commands::Up { id } => {
            if !queue.move_up(JobId(id))? {
                println!("Job {} is already first", id);
            }
            queue.persist(&store)?;
        }
        Commands::Down { id } => {
            if !queue.move_down(JobId(id))? {
                println!("Job {} is already last", id);
            }
            queue.persist(&store)?;
        }
        Commands::Probe { file } => match probe::probe_duration(&cfg, &file).await? {
            Some(secs) => println!("{}", progress::format_duration(secs)),
            None => println!("unknown"),
        },
        Commands::Run { job, show_log } => {
            let started = Utc::now();
            match job {
                Some(id) => queue.start_one(JobId(id))?,
                None => queue.start_all(),
            }

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let mut aborting = false;

            while queue.is_running() {
                tokio::select! {
                    event = runner_events.recv() => match event {
                        Some(event) => queue.handle_runner_event(event),
                        None => break,
                    },
                    _ = &mut ctrl_c, if !aborting => {
                        warn!("Interrupted, aborting the running job");
                        aborting = true;
                        queue.abort();
                    }
                }

                while let Ok(event) = queue_events.try_recv() {
                    report(&queue, event);
                }
            }
            while let Ok(event) = queue_events.try_recv() {
                report(&queue, event);
            }

            let failed: Vec<_> = queue
                .jobs()
                .iter()
                .filter(|j| j.status() == JobStatus::Error)
                .collect();
            info!(
                "Run took {}s, {} finished, {} failed",
                (Utc::now() - started).num_seconds(),
                queue.count_finished(),
                failed.len()
            );
            if show_log {
                for job in &failed {
                    println!("--- job {} ({}) ---", job.id, job.display_name());
                    println!("{}", job.log().trim_end());
                }
            }

            let kept = queue.persist(&store)?;
            debug!("{} job(s) left in the queue", kept);
        }
    }

    Ok(())
}

fn report(queue: &JobQueue<ProcessRunner>, event: QueueEvent) {
    match event {
        QueueEvent::ProgressUpdated { .. } => {
            info!("{}", queue.title());
        }
        QueueEvent::JobFinished { job, outcome } => {
            let name = queue
                .job(job)
                .map(|j| j.display_name())
                .unwrap_or_default();
            println!("Job {} ({}): {}", job, name, outcome);
        }
        QueueEvent::RunFinished { completed } => {
            println!("Done, {} job(s) completed", completed);
        }
        QueueEvent::JobSelectedChanged { .. } | QueueEvent::QueueCountChanged { .. } => {}
    }
}
