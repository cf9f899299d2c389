#![allow(clippy::missing_errors_doc)] // Internal functions don't need # Errors docs
#![allow(clippy::module_name_repetitions)] // e.g., TaskStatus in task module is fine
#![allow(clippy::too_many_lines)] // Some command handlers are naturally long
#![allow(clippy::struct_excessive_bools)] // Config structs can have multiple bool fields
#![allow(clippy::cast_possible_truncation)] // We're careful with our casts
#![allow(clippy::cast_sign_loss)] // Count conversions are guarded with max(0)
#![allow(clippy::cast_precision_loss)] // Quota fractions tolerate f64 precision loss

//! wise-magpie - a background agent that spends idle Claude quota on your
//! task backlog
//!
//! A single binary that provides both:
//! - CLI mode: manage tasks, quota, config, and review finished branches
//! - Daemon mode: the tick loop that detects idleness and dispatches work
//!
//! Usage:
//!   wise-magpie start            # Detach the daemon
//!   wise-magpie tasks add "..."  # Queue work for the next idle window

mod activity;
mod assistant;
mod budget;
mod cli;
mod config;
mod daemon;
mod errors;
mod executor;
mod git;
mod notify;
mod policy;
mod predictor;
mod priority;
mod quota;
mod review;
mod sources;
mod store;
mod task;

use activity::ProcessPresenceProbe;
use assistant::AssistantCli;
use budget::BudgetAccountant;
use chrono::{Local, Utc};
use clap::Parser;
use cli::{Cli, Commands, ConfigAction, QuotaAction, ReviewAction, ScheduleAction, TasksAction};
use config::{Config, ConfigDir};
use daemon::{Daemon, SingletonLock};
use errors::{MagpieError, Result};
use predictor::{ActivityPattern, IdlePredictor};
use quota::{HttpQuotaUpstream, QuotaAccountant};
use sources::{Aggregator, ScanContext};
use std::path::PathBuf;
use std::process::Stdio;
use store::{NewTask, Store, TaskFilter};
use task::{ModelTier, RequestedModel, TaskSource, TaskStatus};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let dirs = cli
        .config_dir
        .clone()
        .map(ConfigDir::at)
        .unwrap_or_else(ConfigDir::resolve);

    // The foreground daemon also logs to the config-dir log file
    let log_file = matches!(cli.command, Commands::Start { foreground: true })
        .then(|| dirs.log_file());
    let _guard = init_tracing(&cli.log_level, log_file);

    if let Err(e) = run(cli, dirs).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn init_tracing(
    level: &str,
    log_file: Option<PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    match log_file {
        Some(path) => {
            let dir = path.parent().map(PathBuf::from).unwrap_or_default();
            let file = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("assistant.log"));
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

async fn run(cli: Cli, dirs: ConfigDir) -> Result<()> {
    match cli.command {
        Commands::Config { action } => handle_config(action, &dirs),
        Commands::Quota { action } => handle_quota(action, &dirs).await,
        Commands::Schedule { action } => handle_schedule(action, &dirs),
        Commands::Tasks { action } => handle_tasks(action, &dirs),
        Commands::Review { action } => handle_review(action, &dirs),
        Commands::Start { foreground } => handle_start(&dirs, foreground).await,
        Commands::Stop => handle_stop(&dirs),
        Commands::Status => handle_status(&dirs),
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }
    }
}

// ── config ───────────────────────────────────────────────────────────────

fn handle_config(action: ConfigAction, dirs: &ConfigDir) -> Result<()> {
    match action {
        ConfigAction::Init => {
            dirs.ensure_exists()?;
            let path = dirs.config_file();
            if path.exists() {
                return Err(MagpieError::Config(format!(
                    "{} already exists; edit it instead",
                    path.display()
                )));
            }
            std::fs::write(&path, Config::default_file_contents())?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = Config::load(&dirs.config_file())?;
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| MagpieError::Config(e.to_string()))?;
            print!("{rendered}");
            Ok(())
        }
        ConfigAction::Edit => {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let path = dirs.config_file();
            if !path.exists() {
                return Err(MagpieError::Config(format!(
                    "{} not found; run `wise-magpie config init` first",
                    path.display()
                )));
            }
            let status = std::process::Command::new(&editor).arg(&path).status()?;
            if !status.success() {
                return Err(MagpieError::Config(format!("{editor} exited non-zero")));
            }
            // Reparse so syntax errors surface immediately
            Config::load(&path)?;
            Ok(())
        }
    }
}

// ── quota ────────────────────────────────────────────────────────────────

async fn handle_quota(action: QuotaAction, dirs: &ConfigDir) -> Result<()> {
    let config = Config::load(&dirs.config_file())?;
    let store = Store::open(&dirs.db_file())?;
    let quota = QuotaAccountant::new(config.quota.clone());

    match action {
        QuotaAction::Show => {
            let window = store.get_quota_window()?;
            let rolls_in = quota.hours_until_roll(&store, Utc::now())?;
            println!(
                "Window started {} (rolls in {rolls_in:.1}h)",
                window.window_started_at.with_timezone(&Local)
            );
            println!("{:<8} {:>6} {:>10} {:>9} {:>10}", "model", "limit", "dispatch", "used", "remaining");
            for tier in ModelTier::ALL {
                println!(
                    "{:<8} {:>6} {:>10} {:>9} {:>10}",
                    tier.as_str(),
                    quota.configured_limit(tier),
                    quota.effective_limit(tier),
                    window.consumed(tier),
                    quota.remaining(&store, tier)?,
                );
            }
            if let Some(at) = window.last_correction_at {
                println!("Last corrected {}", at.with_timezone(&Local));
            }
            Ok(())
        }
        QuotaAction::Sync => {
            let url = config.quota.sync_url.clone().ok_or_else(|| {
                MagpieError::Config("quota.sync_url is not configured".to_string())
            })?;
            let snapshot = HttpQuotaUpstream::new(&url)?.fetch().await?;
            quota.apply_upstream_snapshot(&store, &snapshot)?;
            println!(
                "Synced: opus {} / sonnet {} / haiku {} remaining",
                snapshot.opus, snapshot.sonnet, snapshot.haiku
            );
            Ok(())
        }
        QuotaAction::Correct { model, remaining } => {
            let tier: ModelTier = model
                .parse()
                .map_err(MagpieError::Config)?;
            quota.correct(&store, tier, remaining)?;
            println!(
                "{} corrected: {} autonomous messages remaining",
                tier,
                quota.remaining(&store, tier)?
            );
            Ok(())
        }
        QuotaAction::History => {
            let corrections = store.list_quota_corrections(50)?;
            if corrections.is_empty() {
                println!("No corrections recorded");
                return Ok(());
            }
            for c in corrections {
                println!(
                    "{}  {:<8} set to {:>5} remaining  ({})",
                    c.applied_at.with_timezone(&Local),
                    c.model.as_str(),
                    c.remaining_set,
                    c.origin
                );
            }
            Ok(())
        }
    }
}

// ── schedule ─────────────────────────────────────────────────────────────

fn handle_schedule(action: ScheduleAction, dirs: &ConfigDir) -> Result<()> {
    let _config = Config::load(&dirs.config_file())?;
    let store = Store::open(&dirs.db_file())?;
    let samples = store.list_recent_samples(14)?;
    let pattern = ActivityPattern::learn(&samples);

    match action {
        ScheduleAction::Show => {
            const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
            println!("Learned activity (last 14 days, {} samples)", samples.len());
            println!("     {}", (0..24).map(|h| format!("{h:>2}")).collect::<Vec<_>>().join(" "));
            for (day, label) in DAYS.iter().enumerate() {
                let cells: Vec<String> = (0..24)
                    .map(|hour| format!(" {}", shade(pattern.probability(day, hour))))
                    .collect();
                println!("{label}  {}", cells.join(" "));
            }
            println!("   . <30%   o 30-49%   O 50-79%   # >=80% likely active");
            Ok(())
        }
        ScheduleAction::Predict => {
            let predictor = IdlePredictor::new(pattern);
            let now = Local::now();
            match predictor.minutes_until_likely_return(now) {
                Some(0) => println!("Operator is likely active right now"),
                Some(minutes) => println!("Likely return in ~{minutes} minutes"),
                None => println!("No likely return within the next 8 hours"),
            }
            let idle = predictor.longest_predicted_idle_within(now, 8);
            println!("Longest predicted idle window in the next 8h: {idle} minutes");
            Ok(())
        }
    }
}

fn shade(probability: f64) -> char {
    if probability >= 0.8 {
        '#'
    } else if probability >= 0.5 {
        'O'
    } else if probability >= 0.3 {
        'o'
    } else {
        '.'
    }
}

// ── tasks ────────────────────────────────────────────────────────────────

fn handle_tasks(action: TasksAction, dirs: &ConfigDir) -> Result<()> {
    let config = Config::load(&dirs.config_file())?;
    let store = Store::open(&dirs.db_file())?;

    match action {
        TasksAction::List { status } => {
            let filter = TaskFilter {
                status: status
                    .as_deref()
                    .map(str::parse)
                    .transpose()
                    .map_err(MagpieError::Config)?,
                limit: None,
            };
            let tasks = store.list_tasks(filter)?;
            if tasks.is_empty() {
                println!("No tasks");
                return Ok(());
            }
            println!(
                "{:>4}  {:<16} {:<13} {:>4}  {}",
                "id", "status", "source", "prio", "title"
            );
            for task in tasks {
                let retries = if task.retry_count > 0 {
                    format!(" (retried x{})", task.retry_count)
                } else {
                    String::new()
                };
                println!(
                    "{:>4}  {:<16} {:<13} {:>4}  {}{retries}",
                    task.id,
                    task.status.as_str(),
                    task.source.as_str(),
                    task.priority,
                    task.title,
                );
            }
            Ok(())
        }
        TasksAction::Add {
            title,
            description,
            model,
            work_dir,
        } => {
            let requested: RequestedModel = model
                .parse()
                .map_err(MagpieError::Config)?;
            let work_dir = work_dir.unwrap_or_else(|| PathBuf::from("."));
            let new = NewTask {
                priority: priority::score(TaskSource::Manual, &title, description.as_deref()),
                title,
                description,
                source: TaskSource::Manual,
                source_ref: None,
                requested_model: requested,
                work_dir,
            };
            let task = store.create_task(&new)?.ok_or_else(|| {
                MagpieError::Config("manual task unexpectedly deduplicated".to_string())
            })?;
            println!(
                "Queued task {} (priority {}): {}",
                task.id, task.priority, task.title
            );
            Ok(())
        }
        TasksAction::Scan { work_dir } => {
            git::ensure_git_available()?;
            let work_dir = work_dir.unwrap_or_else(|| config.auto_tasks.work_dir());
            let aggregator = Aggregator::standard(&config);
            let ctx = ScanContext {
                store: &store,
                config: &config,
                now: Utc::now(),
            };
            let report = aggregator.scan(&ctx, &work_dir)?;
            println!(
                "Scan of {}: {} new, {} already known",
                work_dir.display(),
                report.created,
                report.skipped
            );
            Ok(())
        }
        TasksAction::Remove { id } => {
            store.remove_task(id)?;
            println!("Removed task {id}");
            Ok(())
        }
    }
}

// ── review ───────────────────────────────────────────────────────────────

fn handle_review(action: ReviewAction, dirs: &ConfigDir) -> Result<()> {
    let _config = Config::load(&dirs.config_file())?;
    let store = Store::open(&dirs.db_file())?;

    match action {
        ReviewAction::List => {
            let tasks = review::list(&store)?;
            if tasks.is_empty() {
                println!("Nothing awaiting review");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{:>4}  {}  [{}]  ${:.2}",
                    task.id,
                    task.title,
                    task.branch_name.as_deref().unwrap_or("?"),
                    task.actual_cost_usd.unwrap_or(0.0),
                );
            }
            Ok(())
        }
        ReviewAction::Show { id } => {
            let task = store
                .get_task(id)?
                .ok_or_else(|| MagpieError::Config(format!("no such task: {id}")))?;
            println!("Task {}: {}", task.id, task.title);
            println!("  status:   {}", task.status);
            println!("  source:   {}", task.source);
            println!("  work dir: {}", task.work_dir.display());
            if let Some(branch) = &task.branch_name {
                println!("  branch:   {branch}");
            }
            if let Some(cost) = task.actual_cost_usd {
                println!("  cost:     ${cost:.2}");
            }
            if let Some(desc) = &task.description {
                println!("\n{desc}");
            }
            if let Some(summary) = &task.result_summary {
                println!("\nResult:\n{summary}");
            }
            Ok(())
        }
        ReviewAction::Approve { id } => {
            git::ensure_git_available()?;
            let task = review::approve(&store, id)?;
            println!("Merged task {} into the base branch", task.id);
            Ok(())
        }
        ReviewAction::Reject { id } => {
            git::ensure_git_available()?;
            let task = review::reject(&store, id)?;
            println!("Rejected task {} and discarded its branch", task.id);
            Ok(())
        }
        ReviewAction::Respond { id, feedback } => {
            let followup = review::respond(&store, id, &feedback)?;
            println!("Queued follow-up task {}", followup.id);
            Ok(())
        }
    }
}

// ── daemon lifecycle ─────────────────────────────────────────────────────

async fn handle_start(dirs: &ConfigDir, foreground: bool) -> Result<()> {
    let config = Config::load(&dirs.config_file())?;
    git::ensure_git_available()?;
    AssistantCli::new(&config.assistant).check_available()?;
    dirs.ensure_exists()?;

    if foreground {
        return run_daemon(config, dirs.clone()).await;
    }

    // Detach: re-exec ourselves in foreground mode, log to the daemon log
    let exe = std::env::current_exe()?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dirs.log_file())?;
    let err = log.try_clone()?;
    let mut child = std::process::Command::new(exe)
        .args(["start", "--foreground"])
        .env(config::CONFIG_DIR_ENV, &dirs.root)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err))
        .spawn()?;

    // Give it a moment to grab the singleton lock or die trying
    std::thread::sleep(std::time::Duration::from_millis(500));
    if let Some(status) = child.try_wait()? {
        return Err(MagpieError::Config(format!(
            "daemon exited during startup with {status}; check {}",
            dirs.log_file().display()
        )));
    }

    println!("Daemon started");
    println!("- pid: {}", child.id());
    println!("- log: {}", dirs.log_file().display());
    Ok(())
}

async fn run_daemon(config: Config, dirs: ConfigDir) -> Result<()> {
    let _lock = SingletonLock::acquire(&dirs.pid_file())?;

    let probe = Box::new(ProcessPresenceProbe::new(config.assistant.binary.clone()));
    let mut daemon = Daemon::new(config, dirs, probe)?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = tx.send(true);
    });

    daemon.run(rx).await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return,
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn handle_stop(dirs: &ConfigDir) -> Result<()> {
    let pid_path = dirs.pid_file();
    let Some(pid) = read_pid(&pid_path) else {
        println!("Daemon is not running");
        return Ok(());
    };
    if !is_pid_running(pid) {
        let _ = std::fs::remove_file(&pid_path);
        println!("Daemon was not running (stale pid file cleaned)");
        return Ok(());
    }

    terminate_pid(pid)?;
    // A running task is allowed to finish; don't block the terminal on it
    for _ in 0..100 {
        if !is_pid_running(pid) {
            println!("Daemon stopped (pid {pid})");
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    println!("Stop requested; daemon (pid {pid}) will exit after the current task");
    Ok(())
}

fn handle_status(dirs: &ConfigDir) -> Result<()> {
    let config = Config::load(&dirs.config_file())?;
    let store = Store::open(&dirs.db_file())?;

    match read_pid(&dirs.pid_file()) {
        Some(pid) if is_pid_running(pid) => {
            println!("Daemon: running (pid {pid})");
            if let Some(meta) = store.get_daemon_meta()? {
                if let Some(tick) = meta.last_tick_at {
                    let ago = (Utc::now() - tick).num_seconds();
                    println!("- last tick {ago}s ago");
                }
            }
        }
        _ => println!("Daemon: stopped"),
    }

    let quota = QuotaAccountant::new(config.quota.clone());
    print!("Quota:");
    for tier in ModelTier::ALL {
        print!(" {} {}", tier.as_str(), quota.remaining(&store, tier)?);
    }
    println!(" (autonomous messages remaining)");

    let budget = BudgetAccountant::new(config.budget.clone());
    println!(
        "Budget: ${:.2} of ${:.2} spent today",
        budget.daily_spent(&store, Utc::now())?,
        budget.max_daily_usd()
    );

    let count = |status: TaskStatus| -> Result<usize> {
        Ok(store
            .list_tasks(TaskFilter {
                status: Some(status),
                limit: None,
            })?
            .len())
    };
    println!(
        "Tasks: {} pending, {} running, {} awaiting review, {} failed",
        count(TaskStatus::Pending)?,
        count(TaskStatus::Running)?,
        count(TaskStatus::AwaitingReview)?,
        count(TaskStatus::Failed)?,
    );

    let samples = store.list_recent_samples(14)?;
    if !samples.is_empty() {
        let predictor = IdlePredictor::new(ActivityPattern::learn(&samples));
        let idle = predictor.longest_predicted_idle_within(Local::now(), 8);
        if idle >= 60 {
            println!(
                "Next 8h: up to {}h{:02}m of predicted idle time",
                idle / 60,
                idle % 60
            );
        }
    }
    Ok(())
}

fn read_pid(path: &std::path::Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn terminate_pid(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill")
            .arg(pid.to_string())
            .status()?;
        if !status.success() {
            return Err(MagpieError::Config(format!(
                "failed to signal daemon pid {pid}"
            )));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(MagpieError::Config(
            "stop is only implemented on unix".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shade_levels() {
        assert_eq!(shade(0.1), '.');
        assert_eq!(shade(0.35), 'o');
        assert_eq!(shade(0.6), 'O');
        assert_eq!(shade(0.95), '#');
    }

    #[test]
    fn test_read_pid_parses() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("assistant.pid");
        assert!(read_pid(&path).is_none());

        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid(&path), Some(1234));

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_pid(&path).is_none());
    }

    #[test]
    fn test_self_pid_is_running() {
        assert!(is_pid_running(std::process::id()));
    }
}
