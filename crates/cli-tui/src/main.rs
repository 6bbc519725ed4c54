use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ffqueue::{
    progress, JobId, JobQueue, JobRecord, JobStatus, JobStore, Outcome, QueueConfig, QueueEvent,
    ProcessRunner, RunnerEvent,
};
use humansize::{format_size, DECIMAL};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::{stdout, Stdout};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::mpsc::UnboundedReceiver;

/// How long a quit waits for an aborted job to report back
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct App {
    queue: JobQueue,
    queue_events: UnboundedReceiver<QueueEvent>,
    system: System,
    table_state: TableState,
    show_log: bool,
    message: String,
    should_quit: bool,
    state_file: PathBuf,
}

impl App {
    fn new(queue: JobQueue, queue_events: UnboundedReceiver<QueueEvent>, state_file: PathBuf) -> Self {
        Self {
            queue,
            queue_events,
            system: System::new(),
            table_state: TableState::default(),
            show_log: false,
            message: String::new(),
            should_quit: false,
            state_file,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
    }

    /// Hand runner output to the queue, then apply what the queue reports back
    fn pump(&mut self, runner_events: &mut UnboundedReceiver<RunnerEvent>) {
        while let Ok(event) = runner_events.try_recv() {
            self.queue.handle_runner_event(event);
        }
        while let Ok(event) = self.queue_events.try_recv() {
            self.on_queue_event(event);
        }
    }

    fn on_queue_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::JobSelectedChanged { index } => self.table_state.select(index),
            QueueEvent::JobFinished { job, outcome } => {
                self.message = match outcome {
                    Outcome::Success => format!("Job {} finished", job),
                    Outcome::Failed(reason) => format!("Job {} failed: {}", job, reason),
                    Outcome::Aborted => format!("Job {} aborted", job),
                };
            }
            QueueEvent::RunFinished { completed } => {
                self.message = format!("Run finished, {} job(s) completed", completed);
            }
            QueueEvent::ProgressUpdated { .. } | QueueEvent::QueueCountChanged { .. } => {}
        }
    }

    fn selected_id(&self) -> Option<JobId> {
        self.queue.selected_job().map(|j| j.id)
    }

    fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) {
        let shift = modifiers.contains(KeyModifiers::SHIFT);
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Up if shift => self.move_selected(true),
            KeyCode::Down if shift => self.move_selected(false),
            KeyCode::Char('K') => self.move_selected(true),
            KeyCode::Char('J') => self.move_selected(false),
            KeyCode::Up | KeyCode::Char('k') => self.step_selection(-1),
            KeyCode::Down | KeyCode::Char('j') => self.step_selection(1),
            KeyCode::Char('s') => self.queue.start_all(),
            KeyCode::Enter => {
                if let Some(id) = self.selected_id() {
                    if let Err(e) = self.queue.start_one(id) {
                        self.message = e.to_string();
                    }
                }
            }
            KeyCode::Char('a') => {
                if self.queue.is_running() {
                    self.queue.abort();
                    self.message = "Aborting".to_string();
                }
            }
            KeyCode::Char('d') | KeyCode::Delete => {
                if let Some(id) = self.selected_id() {
                    match self.queue.remove(id) {
                        Ok(job) => self.message = format!("Removed {}", job.display_name()),
                        Err(e) => self.message = e.to_string(),
                    }
                }
            }
            KeyCode::Char('D') => {
                let count = self.queue.len();
                self.queue.remove_all();
                self.message = format!("Removed {} job(s)", count);
            }
            KeyCode::Char('c') => self.queue.clear_finished(),
            KeyCode::Char('l') => self.show_log = !self.show_log,
            _ => {}
        }
    }

    fn step_selection(&mut self, delta: isize) {
        let len = self.queue.len();
        if len == 0 {
            return;
        }
        let current = self.queue.selected().unwrap_or(0) as isize;
        let next = (current + delta).clamp(0, len as isize - 1) as usize;
        self.queue.select(Some(next));
    }

    fn move_selected(&mut self, up: bool) {
        let Some(id) = self.selected_id() else {
            return;
        };
        let moved = if up {
            self.queue.move_up(id)
        } else {
            self.queue.move_down(id)
        };
        if let Err(e) = moved {
            self.message = e.to_string();
        }
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.queue.jobs().iter().filter(|j| j.status() == status).count()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = QueueConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;

    // Runner tasks live on this runtime; the UI loop keeps the main thread
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let _guard = runtime.enter();

    let store = JobStore::new(&cfg.state_file);
    let (runner, mut runner_events) = ProcessRunner::new(&cfg);
    let (mut queue, queue_events) = JobQueue::new(runner);
    let loaded = queue
        .load(&store)
        .with_context(|| format!("Failed to load job list from {}", store.path().display()))?;

    let mut app = App::new(queue, queue_events, cfg.state_file.clone());
    app.message = format!("Loaded {} job(s)", loaded);

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_ui(&mut terminal, &mut app, &mut runner_events);

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    if app.queue.is_running() {
        app.queue.abort();
        let drained = runtime.block_on(tokio::time::timeout(
            SHUTDOWN_GRACE,
            app.queue.drive(&mut runner_events),
        ));
        if drained.is_err() {
            eprintln!("Running job did not stop within {}s", SHUTDOWN_GRACE.as_secs());
        }
    }

    app.queue
        .persist(&store)
        .with_context(|| format!("Failed to save job list to {}", store.path().display()))?;

    result
}

fn run_ui(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    runner_events: &mut UnboundedReceiver<RunnerEvent>,
) -> Result<()> {
    loop {
        app.refresh();
        app.pump(runner_events);

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key.code, key.modifiers);
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

/// Interactive ffmpeg job manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);

    if app.show_log {
        let middle = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(main_chunks[1]);
        render_job_table(f, app, middle[0]);
        render_log(f, app, middle[1]);
    } else {
        render_job_table(f, app, main_chunks[1]);
    }

    render_status_bar(f, app, main_chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(50),
        ])
        .split(area);

    let cpu_raw = app.system.global_cpu_usage();
    let cpu_usage = if cpu_raw.is_finite() {
        cpu_raw.clamp(0.0, 100.0)
    } else {
        0.0
    };

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        (app.system.used_memory() as f64 / total_memory as f64 * 100.0).clamp(0.0, 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    let job_percent = app
        .queue
        .running_job()
        .and_then(|id| app.queue.job(id))
        .map(|j| j.percent().min(100) as u16)
        .unwrap_or(0);
    let job_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(app.queue.title()))
        .gauge_style(Style::default().fg(Color::Magenta))
        .percent(job_percent)
        .label(format!("{}%", job_percent));
    f.render_widget(job_gauge, chunks[2]);
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    if area.height < 3 {
        let error_msg = Paragraph::new("Not enough space")
            .block(Block::default().borders(Borders::ALL).title("Jobs"));
        f.render_widget(error_msg, area);
        return;
    }

    let header = Row::new(vec!["#", "ST", "FILE", "SIZE", "DUR", "PROG", "TIME"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.queue.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "-".to_string(),
            format!("No jobs in {}", app.state_file.display()),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])]
    } else {
        app.queue.jobs().iter().map(job_row).collect()
    };

    let widths = [
        Constraint::Length(4),
        Constraint::Length(4),
        Constraint::Percentage(50),
        Constraint::Length(9),
        Constraint::Length(9),
        Constraint::Length(5),
        Constraint::Length(9),
    ];

    let title = format!(
        "Jobs ({}/{} finished)",
        app.queue.count_finished(),
        app.queue.len()
    );

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn job_row(job: &JobRecord) -> Row<'static> {
    let (status_str, color) = match job.status() {
        JobStatus::Waiting => ("WAIT", Color::Reset),
        JobStatus::Running => ("RUN", Color::Yellow),
        JobStatus::Finished => ("OK", Color::Green),
        JobStatus::Error => ("ERR", Color::Red),
    };

    let size = std::fs::metadata(&job.source_path)
        .map(|m| format_size(m.len(), DECIMAL))
        .unwrap_or_else(|_| "-".to_string());

    let progress_str = match job.status() {
        JobStatus::Running | JobStatus::Finished => format!("{}%", job.percent()),
        _ => "-".to_string(),
    };

    Row::new(vec![
        job.id.to_string(),
        status_str.to_string(),
        truncate_string(&job.display_name(), 60),
        size,
        job.duration.clone(),
        progress_str,
        elapsed(job),
    ])
    .style(Style::default().fg(color))
    .height(1)
}

/// Wall time of the current or last attempt
fn elapsed(job: &JobRecord) -> String {
    match (job.started_at, job.finished_at) {
        (Some(started), Some(finished)) => progress::format_duration((finished - started).num_seconds()),
        (Some(started), None) => progress::format_duration((Utc::now() - started).num_seconds()),
        _ => "-".to_string(),
    }
}

fn render_log(f: &mut Frame, app: &App, area: Rect) {
    let (title, text) = match app.queue.selected_job() {
        Some(job) => {
            // ffmpeg rewrites its progress line with \r, show each state as a line
            let visible = area.height.saturating_sub(2) as usize;
            let lines: Vec<&str> = job
                .log()
                .split(|c: char| c == '\r' || c == '\n')
                .filter(|l| !l.trim().is_empty())
                .collect();
            let start = lines.len().saturating_sub(visible);
            (format!("Log: job {}", job.id), lines[start..].join("\n"))
        }
        None => ("Log".to_string(), String::new()),
    };

    let paragraph = Paragraph::new(text).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(paragraph, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let status_text = format!(
        "Total: {} | Waiting: {} | Running: {} | Finished: {} | Error: {} | {} | s=start all enter=start a=abort d=remove c=clear J/K=move l=log q=quit",
        app.queue.len(),
        app.count_by_status(JobStatus::Waiting),
        app.count_by_status(JobStatus::Running),
        app.count_by_status(JobStatus::Finished),
        app.count_by_status(JobStatus::Error),
        truncate_string(&app.message, 50),
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(Style::default())
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
