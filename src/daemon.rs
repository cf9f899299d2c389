//! The daemon loop: six-gate admission, dispatch, and lifecycle
//!
//! One long-lived process per config directory, enforced by an exclusive
//! file lock on the pid file. Every tick samples presence, rolls the quota
//! window, and walks the admission gates in order; a dispatch decrements
//! quota before the executor starts and refunds it if the run never does.
//! All per-tick errors are contained here; only store corruption or a lost
//! lock aborts the daemon.

use crate::activity::{ActivityMonitor, UserPresenceProbe};
use crate::assistant::AssistantCli;
use crate::budget::BudgetAccountant;
use crate::config::{Config, ConfigDir};
use crate::errors::{MagpieError, Result};
use crate::executor::{ExecutionOutcome, Executor};
use crate::notify;
use crate::policy::{classify, ModelPolicy, SelectionContext};
use crate::predictor::PredictorCache;
use crate::quota::{HttpQuotaUpstream, QuotaAccountant};
use crate::sources::{Aggregator, ScanContext};
use crate::store::Store;
use crate::task::{ModelTier, RequestedModel, Task, TaskStatus};
use chrono::{DateTime, Local, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Samples older than this are pruned; two weeks are kept for learning
const SAMPLE_RETENTION_DAYS: u32 = 30;

/// Horizon handed to the idle predictor for upgrade decisions
const IDLE_LOOKAHEAD_HOURS: u32 = 8;

/// Why a tick declined to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UserActive,
    IdleTooShort,
    ReturnImminent,
    BudgetExhausted,
    NoPendingTask,
    QuotaExhausted,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserActive => "user_active",
            Self::IdleTooShort => "idle_too_short",
            Self::ReturnImminent => "return_imminent",
            Self::BudgetExhausted => "budget_exhausted",
            Self::NoPendingTask => "no_pending_task",
            Self::QuotaExhausted => "quota_exhausted",
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Dispatched {
        task_id: i64,
        tier: ModelTier,
        success: bool,
    },
}

/// Exclusive pid-file lock making the daemon a singleton
///
/// The OS releases the lock when the owning process dies, so a stale pid
/// file from a crashed daemon is reclaimed simply by locking it again.
#[derive(Debug)]
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    pub fn acquire(pid_path: &Path) -> Result<Self> {
        if let Some(parent) = pid_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(pid_path)?;

        if file.try_lock_exclusive().is_err() {
            let pid = std::fs::read_to_string(pid_path)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(0);
            return Err(MagpieError::AlreadyRunning { pid });
        }

        file.set_len(0)?;
        let mut writer = &file;
        writer.write_all(std::process::id().to_string().as_bytes())?;
        writer.flush()?;

        Ok(Self {
            file,
            path: pid_path.to_path_buf(),
        })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Daemon {
    config: Config,
    store: Store,
    monitor: ActivityMonitor,
    quota: QuotaAccountant,
    budget: BudgetAccountant,
    assistant: AssistantCli,
    predictors: PredictorCache,
    last_sync: Option<Instant>,
}

impl Daemon {
    /// Assemble the daemon from config; the presence probe is injected so
    /// headless environments and tests can supply their own signal.
    pub fn new(
        config: Config,
        dirs: ConfigDir,
        probe: Box<dyn UserPresenceProbe>,
    ) -> Result<Self> {
        let store = Store::open(&dirs.db_file())?;
        let assistant = AssistantCli::new(&config.assistant);
        let quota = QuotaAccountant::new(config.quota.clone());
        let budget = BudgetAccountant::new(config.budget.clone());
        Ok(Self {
            config,
            store,
            monitor: ActivityMonitor::new(probe),
            quota,
            budget,
            assistant,
            predictors: PredictorCache::new(),
            last_sync: None,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Crash recovery and bookkeeping performed once on startup
    pub fn startup(&self) -> Result<()> {
        let swept = self.store.sweep_orphan_running()?;
        if swept > 0 {
            info!(swept, "Recovered tasks from a previous unclean shutdown");
        }
        self.store.set_daemon_meta(std::process::id(), Utc::now())?;
        info!(pid = std::process::id(), "Daemon started");
        Ok(())
    }

    /// Run the tick loop until a shutdown signal arrives
    ///
    /// The singleton lock must already be held by the caller. A running
    /// task is never interrupted: signals are only observed between ticks,
    /// and the executor's own timeout bounds how long that can take.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.startup()?;
        let poll = std::time::Duration::from_secs(self.config.daemon.poll_interval);

        loop {
            let now = Utc::now();
            match self.tick(now).await {
                Ok(outcome) => debug!(?outcome, "Tick complete"),
                // Store failures are fatal; anything else is contained
                Err(MagpieError::Store(e)) => {
                    error!("Fatal store error, aborting daemon: {e}");
                    return Err(MagpieError::Store(e));
                }
                Err(e) => warn!("Tick failed: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown signal received, exiting");
                    return Ok(());
                }
            }
        }
    }

    /// One pass of the six-gate admission check and, if admitted, a dispatch
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.monitor.begin_tick();
        self.store.touch_last_tick(now)?;

        // Observations only count after the window is current
        let active = self.monitor.sample(&self.store, now)?;
        if self.quota.roll_if_due(&self.store, now)? {
            self.store.prune_samples(SAMPLE_RETENTION_DAYS)?;
        }
        self.maybe_sync_upstream().await;

        // Gate 1: the operator is at the keyboard
        if active {
            return Ok(skipped(SkipReason::UserActive));
        }

        // Gate 2: not idle long enough yet
        let threshold = i64::from(self.config.activity.idle_threshold_minutes);
        if let Some(idle) = self.monitor.idle_minutes(&self.store, now)? {
            if idle < threshold {
                debug!(idle, threshold, "Idle window too short");
                return Ok(skipped(SkipReason::IdleTooShort));
            }
        }

        // Gate 3: the predictor expects the operator back soon
        let local_now = now.with_timezone(&Local);
        let store = &self.store;
        let predictor = self
            .predictors
            .get(|| store.list_recent_samples(14))?;
        let buffer = i64::from(self.config.activity.return_buffer_minutes);
        if let Some(minutes) = predictor.minutes_until_likely_return(local_now) {
            if minutes < buffer {
                debug!(minutes, buffer, "Return imminent");
                return Ok(skipped(SkipReason::ReturnImminent));
            }
        }
        let predicted_idle_minutes =
            predictor.longest_predicted_idle_within(local_now, IDLE_LOOKAHEAD_HOURS);

        // Gate 4: out of budget for the day (cheapest tier as the floor)
        let floor_estimate = ModelTier::Haiku.average_task_cost_usd();
        if !self.budget.admits_task(&self.store, now, floor_estimate)? {
            info!("Daily budget exhausted, holding until tomorrow");
            return Ok(skipped(SkipReason::BudgetExhausted));
        }

        // Intake runs only when the gates say we might actually dispatch
        if self.config.auto_tasks.enabled {
            self.scan_sources(now)?;
        }

        // Gate 5: anything to do?
        let Some(task) = self.store.claim_next_pending()? else {
            return Ok(skipped(SkipReason::NoPendingTask));
        };

        // Gate 6: claim atomicity makes a second runner impossible; check anyway
        let running = self
            .store
            .list_tasks(crate::store::TaskFilter {
                status: Some(TaskStatus::Running),
                limit: None,
            })?
            .len();
        if running > 1 {
            error!(running, "BUG: more than one task claimed as running");
        }

        let ctx = SelectionContext {
            hours_until_roll: self.quota.hours_until_roll(&self.store, now)?,
            predicted_idle_minutes,
        };
        self.dispatch(task, now, ctx).await
    }

    /// Pick the model, decrement quota, run the executor, settle the books
    async fn dispatch(
        &mut self,
        task: Task,
        now: DateTime<Utc>,
        ctx: SelectionContext,
    ) -> Result<TickOutcome> {
        let difficulty = classify(&task.title, task.description.as_deref());

        let requested = match task.requested_model {
            RequestedModel::Fixed(tier) => RequestedModel::Fixed(tier),
            RequestedModel::Auto if !self.config.assistant.auto_select_model => {
                RequestedModel::Fixed(self.config.assistant.default_tier())
            }
            RequestedModel::Auto => RequestedModel::Auto,
        };

        let Some(mut tier) =
            ModelPolicy::select(&self.store, &self.quota, requested, difficulty, ctx)?
        else {
            info!(task = task.id, "No tier admitted by quota, returning task");
            self.store.unclaim_task(task.id)?;
            return Ok(skipped(SkipReason::QuotaExhausted));
        };

        // The selected tier must also fit the budget; walk down if not
        while !self
            .budget
            .admits_task(&self.store, now, tier.average_task_cost_usd())?
        {
            match tier.downgraded() {
                Some(down) => {
                    debug!(from = %tier, to = %down, "Budget forces a cheaper tier");
                    tier = down;
                }
                None => {
                    self.store.unclaim_task(task.id)?;
                    return Ok(skipped(SkipReason::BudgetExhausted));
                }
            }
        }

        info!(
            task = task.id,
            title = %task.title,
            model = %tier,
            difficulty = difficulty.as_str(),
            "Dispatching task"
        );

        // Decrement-then-dispatch; every non-started path refunds
        self.quota.consume(&self.store, tier, 1)?;

        match Executor::execute(&self.store, &self.assistant, &task, tier).await {
            Ok(ExecutionOutcome::Success { summary, cost_usd }) => {
                self.store.set_task_finished(
                    task.id,
                    TaskStatus::Completed,
                    Some(&summary),
                    Some(cost_usd),
                )?;
                self.store
                    .update_task_status(task.id, TaskStatus::AwaitingReview)?;
                self.budget.record(&self.store, now, cost_usd)?;
                if let Some(task_type) = template_type(&task) {
                    self.store.record_template_run(task_type, now)?;
                }
                if self.config.notify.enabled {
                    notify::task_finished(&task.title, true);
                }
                info!(task = task.id, cost_usd, "Task awaiting review");
                Ok(TickOutcome::Dispatched {
                    task_id: task.id,
                    tier,
                    success: true,
                })
            }
            Ok(ExecutionOutcome::Failed { detail }) => {
                self.store.set_task_finished(
                    task.id,
                    TaskStatus::Failed,
                    Some(&detail),
                    None,
                )?;
                self.store.clear_task_branch(task.id)?;
                self.quota.refund(&self.store, tier, 1)?;
                if self.config.notify.enabled {
                    notify::task_finished(&task.title, false);
                }
                Ok(TickOutcome::Dispatched {
                    task_id: task.id,
                    tier,
                    success: false,
                })
            }
            Err(e) => {
                // Never started (dirty tree, missing tools): task waits
                warn!(task = task.id, "Dispatch aborted before start: {e}");
                self.quota.refund(&self.store, tier, 1)?;
                self.store.unclaim_task(task.id)?;
                Err(e)
            }
        }
    }

    fn scan_sources(&self, now: DateTime<Utc>) -> Result<()> {
        let aggregator = Aggregator::standard(&self.config);
        let ctx = ScanContext {
            store: &self.store,
            config: &self.config,
            now,
        };
        let work_dir = self.config.auto_tasks.work_dir();
        match aggregator.scan(&ctx, &work_dir) {
            Ok(report) if report.created > 0 => {
                info!(created = report.created, "Intake found new tasks");
            }
            Ok(_) => {}
            Err(e) => warn!("Task intake failed: {e}"),
        }
        Ok(())
    }

    /// Upstream sync on its interval; failures are logged and retried later
    async fn maybe_sync_upstream(&mut self) {
        let interval_minutes = self.config.daemon.auto_sync_interval_minutes;
        let Some(url) = self.config.quota.sync_url.clone() else {
            return;
        };
        if interval_minutes == 0 {
            return;
        }
        let due = match self.last_sync {
            None => true,
            Some(at) => at.elapsed().as_secs() >= u64::from(interval_minutes) * 60,
        };
        if !due {
            return;
        }
        self.last_sync = Some(Instant::now());

        match self.sync_upstream(&url).await {
            Ok(()) => info!("Upstream quota sync applied"),
            Err(e) => warn!("Upstream quota sync failed (will retry): {e}"),
        }
    }

    async fn sync_upstream(&self, url: &str) -> Result<()> {
        let upstream = HttpQuotaUpstream::new(url)?;
        let snapshot = upstream.fetch().await?;
        self.quota.apply_upstream_snapshot(&self.store, &snapshot)
    }
}

fn skipped(reason: SkipReason) -> TickOutcome {
    debug!(reason = reason.as_str(), "Tick skipped");
    TickOutcome::Skipped(reason)
}

/// `task_type` of an auto-template task, parsed from its dedup key
fn template_type(task: &Task) -> Option<&str> {
    if task.source != crate::task::TaskSource::AutoTemplate {
        return None;
    }
    task.source_ref.as_deref()?.split(':').next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::UserPresenceProbe;
    use crate::store::{NewTask, TaskFilter};
    use crate::task::TaskSource;
    use chrono::Duration;
    use std::path::Path;
    use std::process::Command;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FlagProbe(Arc<AtomicBool>);

    impl UserPresenceProbe for FlagProbe {
        fn probe(&self) -> Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    fn run(repo: &Path, args: &[&str]) {
        let out = Command::new("git").current_dir(repo).args(args).output().unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn setup_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        run(tmp.path(), &["init", "-b", "main"]);
        run(tmp.path(), &["config", "user.email", "test@test.com"]);
        run(tmp.path(), &["config", "user.name", "Test User"]);
        std::fs::write(tmp.path().join("README.md"), "# Test").unwrap();
        run(tmp.path(), &["add", "."]);
        run(tmp.path(), &["commit", "-m", "init"]);
        tmp
    }

    fn fake_assistant_binary(dir: &Path, script: &str) -> String {
        let bin = dir.join("fake-claude");
        std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&bin).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&bin, perms).unwrap();
        }
        bin.to_string_lossy().to_string()
    }

    struct Harness {
        daemon: Daemon,
        active: Arc<AtomicBool>,
        repo: TempDir,
        _dirs: TempDir,
        _bin: TempDir,
    }

    fn harness(script: &str) -> Harness {
        let dirs_tmp = TempDir::new().unwrap();
        let bin_tmp = TempDir::new().unwrap();
        let repo = setup_repo();

        let mut config = Config::default();
        config.assistant.binary = fake_assistant_binary(bin_tmp.path(), script);
        config.notify.enabled = false;

        let active = Arc::new(AtomicBool::new(false));
        let daemon = Daemon::new(
            config,
            ConfigDir::at(dirs_tmp.path().to_path_buf()),
            Box::new(FlagProbe(Arc::clone(&active))),
        )
        .unwrap();

        Harness {
            daemon,
            active,
            repo,
            _dirs: dirs_tmp,
            _bin: bin_tmp,
        }
    }

    /// Thirty-plus minutes of idle history so gates 2 and 3 pass
    fn seed_idle_history(store: &Store, now: DateTime<Utc>) {
        store
            .record_usage_sample(now - Duration::minutes(31), true)
            .unwrap();
        for m in (1..31).rev() {
            store
                .record_usage_sample(now - Duration::minutes(m), false)
                .unwrap();
        }
    }

    fn add_task(store: &Store, repo: &Path, title: &str, priority: u8) -> i64 {
        store
            .create_task(&NewTask {
                title: title.to_string(),
                description: None,
                source: TaskSource::Manual,
                source_ref: None,
                requested_model: RequestedModel::Auto,
                priority,
                work_dir: repo.to_path_buf(),
            })
            .unwrap()
            .unwrap()
            .id
    }

    const OK_SCRIPT: &str = r#"echo '{"result":"All done","total_cost_usd":0.05}'"#;

    #[tokio::test]
    async fn test_happy_path_dispatch() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        h.daemon
            .store()
            .record_quota_consumption(ModelTier::Sonnet, 10)
            .unwrap();
        let task_id = add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);

        let outcome = h.daemon.tick(now).await.unwrap();
        match outcome {
            TickOutcome::Dispatched {
                task_id: id,
                tier,
                success,
            } => {
                assert_eq!(id, task_id);
                assert_eq!(tier, ModelTier::Sonnet);
                assert!(success);
            }
            TickOutcome::Skipped(reason) => panic!("skipped: {}", reason.as_str()),
        }

        let task = h.daemon.store().get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::AwaitingReview);
        assert!(task.branch_name.is_some());
        assert!((task.actual_cost_usd.unwrap() - 0.05).abs() < 1e-9);

        // Consumed 10 before the tick, 11 after
        let window = h.daemon.store().get_quota_window().unwrap();
        assert_eq!(window.consumed(ModelTier::Sonnet), 11);

        // Cost recorded against today's budget
        let spent = h
            .daemon
            .store()
            .daily_spend(&now.format("%Y-%m-%d").to_string())
            .unwrap();
        assert!((spent - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_gate_user_active() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);
        h.active.store(true, Ordering::SeqCst);

        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(SkipReason::UserActive)
        ));

        let pending = h
            .daemon
            .store()
            .list_tasks(TaskFilter {
                status: Some(TaskStatus::Pending),
                limit: None,
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_gate_idle_too_short() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        // Active only 10 minutes ago
        h.daemon
            .store()
            .record_usage_sample(now - Duration::minutes(10), true)
            .unwrap();
        add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);

        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(SkipReason::IdleTooShort)
        ));
    }

    #[tokio::test]
    async fn test_gate_return_imminent() {
        let mut h = harness(OK_SCRIPT);
        // Predictor says the operator is usually active right now: last week,
        // the whole two hours around this time of day were active, so the
        // buckets the idle history touches all learn well above 0.5
        let now = Utc::now();
        for m in 0..120 {
            h.daemon
                .store()
                .record_usage_sample(now - Duration::days(7) - Duration::minutes(m), true)
                .unwrap();
        }
        seed_idle_history(h.daemon.store(), now);
        add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);

        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(SkipReason::ReturnImminent)
        ));

        // The task is untouched and no quota moved
        let window = h.daemon.store().get_quota_window().unwrap();
        assert_eq!(window.consumed(ModelTier::Sonnet), 0);
    }

    #[tokio::test]
    async fn test_gate_budget_exhausted() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);
        h.daemon
            .store()
            .record_spend(&now.format("%Y-%m-%d").to_string(), 10.0)
            .unwrap();

        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(SkipReason::BudgetExhausted)
        ));
    }

    #[tokio::test]
    async fn test_gate_no_pending_task() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);

        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Skipped(SkipReason::NoPendingTask)
        ));
    }

    #[tokio::test]
    async fn test_downgrade_to_haiku_when_sonnet_spent() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        let task_id = add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);

        // Exhaust sonnet past its effective limit
        let effective = h.daemon.quota.effective_limit(ModelTier::Sonnet);
        h.daemon
            .store()
            .record_quota_consumption(ModelTier::Sonnet, effective)
            .unwrap();

        let outcome = h.daemon.tick(now).await.unwrap();
        match outcome {
            TickOutcome::Dispatched { task_id: id, tier, .. } => {
                assert_eq!(id, task_id);
                assert_eq!(tier, ModelTier::Haiku);
            }
            TickOutcome::Skipped(reason) => panic!("skipped: {}", reason.as_str()),
        }
        let window = h.daemon.store().get_quota_window().unwrap();
        assert_eq!(window.consumed(ModelTier::Haiku), 1);
    }

    #[tokio::test]
    async fn test_upgrade_for_window_headroom() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        let task_id = add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);

        // One hour left in the window, sonnet barely used
        h.daemon
            .store()
            .set_window_started_at(now - Duration::hours(4))
            .unwrap();

        let outcome = h.daemon.tick(now).await.unwrap();
        match outcome {
            TickOutcome::Dispatched { task_id: id, tier, .. } => {
                assert_eq!(id, task_id);
                assert_eq!(tier, ModelTier::Opus);
            }
            TickOutcome::Skipped(reason) => panic!("skipped: {}", reason.as_str()),
        }
    }

    #[tokio::test]
    async fn test_quota_refunded_on_failure() {
        let mut h = harness("echo 'exploded' >&2; exit 1");
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        let task_id = add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);

        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Dispatched { success: false, .. }
        ));

        let task = h.daemon.store().get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.branch_name.is_none());
        assert!(task.result_summary.unwrap().contains("exploded"));

        // Decrement then refund nets to zero
        let window = h.daemon.store().get_quota_window().unwrap();
        assert_eq!(window.consumed(ModelTier::Sonnet), 0);
    }

    #[tokio::test]
    async fn test_dirty_tree_returns_task_to_pending() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        let task_id = add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);
        std::fs::write(h.repo.path().join("wip.txt"), "uncommitted").unwrap();

        let err = h.daemon.tick(now).await.unwrap_err();
        assert!(matches!(err, MagpieError::DirtyWorkingTree(_)));

        let task = h.daemon.store().get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let window = h.daemon.store().get_quota_window().unwrap();
        assert_eq!(window.consumed(ModelTier::Sonnet), 0);
    }

    #[tokio::test]
    async fn test_crash_recovery_on_startup() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);
        let task_id = add_task(h.daemon.store(), h.repo.path(), "Fix login bug", 65);

        // Simulate a crash: task left running with no live daemon
        h.daemon.store().claim_next_pending().unwrap().unwrap();
        h.daemon.startup().unwrap();

        let task = h.daemon.store().get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        // And it is claimable on the next tick
        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Dispatched { success: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_template_completion_recorded() {
        let mut h = harness(OK_SCRIPT);
        let now = Utc::now();
        seed_idle_history(h.daemon.store(), now);

        h.daemon
            .store()
            .create_task(&NewTask {
                title: "Run the test suite".to_string(),
                description: Some("Run the project's test suite.".to_string()),
                source: TaskSource::AutoTemplate,
                source_ref: Some(format!(
                    "run_tests:{}",
                    now.with_timezone(&Local).format("%Y-%m-%d")
                )),
                requested_model: RequestedModel::Auto,
                priority: 25,
                work_dir: h.repo.path().to_path_buf(),
            })
            .unwrap()
            .unwrap();

        let outcome = h.daemon.tick(now).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Dispatched { .. }));
        assert!(h
            .daemon
            .store()
            .last_template_run("run_tests")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_singleton_lock_excludes_second_holder() {
        let tmp = TempDir::new().unwrap();
        let pid_path = tmp.path().join("assistant.pid");

        let lock = SingletonLock::acquire(&pid_path).unwrap();
        let err = SingletonLock::acquire(&pid_path).unwrap_err();
        match err {
            MagpieError::AlreadyRunning { pid } => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(lock);
        assert!(!pid_path.exists(), "pid file removed on release");
        let relock = SingletonLock::acquire(&pid_path);
        assert!(relock.is_ok());
    }
}
