//! Persistent state: tasks, usage samples, quota window, budget, daemon meta
//!
//! A single SQLite database (WAL mode) owns everything durable. The daemon
//! and the one-shot CLI commands open the same file; SQLite's locking plus a
//! busy timeout serialises the writers, and `claim_next_pending` runs in an
//! IMMEDIATE transaction so at most one task can ever be marked running.

use crate::errors::{MagpieError, Result};
use crate::task::{ModelTier, RequestedModel, Task, TaskSource, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// One presence observation
#[derive(Debug, Clone, Copy)]
pub struct UsageSample {
    pub observed_at: DateTime<Utc>,
    pub active: bool,
}

/// The open rolling quota window
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    pub window_started_at: DateTime<Utc>,
    pub opus_consumed: u32,
    pub sonnet_consumed: u32,
    pub haiku_consumed: u32,
    pub last_correction_at: Option<DateTime<Utc>>,
}

impl QuotaWindow {
    pub fn consumed(&self, tier: ModelTier) -> u32 {
        match tier {
            ModelTier::Opus => self.opus_consumed,
            ModelTier::Sonnet => self.sonnet_consumed,
            ModelTier::Haiku => self.haiku_consumed,
        }
    }
}

/// Singleton daemon bookkeeping row
#[derive(Debug, Clone)]
pub struct DaemonMeta {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// One operator/upstream quota correction, kept for `quota history`
#[derive(Debug, Clone)]
pub struct QuotaCorrection {
    pub applied_at: DateTime<Utc>,
    pub model: ModelTier,
    pub remaining_set: u32,
    pub origin: String,
}

/// Fields needed to insert a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub source: TaskSource,
    pub source_ref: Option<String>,
    pub requested_model: RequestedModel,
    pub priority: u8,
    pub work_dir: PathBuf,
}

/// Filter for `list_tasks`
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<u32>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT,
        source TEXT NOT NULL,
        source_ref TEXT,
        requested_model TEXT NOT NULL DEFAULT 'auto',
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        work_dir TEXT NOT NULL,
        branch_name TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        actual_cost_usd REAL,
        result_summary TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_dedup
        ON tasks(source, source_ref) WHERE source_ref IS NOT NULL;

    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

    CREATE TABLE IF NOT EXISTS usage_samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        observed_at TEXT NOT NULL,
        active INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_samples_observed ON usage_samples(observed_at);

    CREATE TABLE IF NOT EXISTS quota_window (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        window_started_at TEXT NOT NULL,
        opus_consumed INTEGER NOT NULL DEFAULT 0,
        sonnet_consumed INTEGER NOT NULL DEFAULT 0,
        haiku_consumed INTEGER NOT NULL DEFAULT 0,
        last_correction_at TEXT
    );

    CREATE TABLE IF NOT EXISTS quota_corrections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        applied_at TEXT NOT NULL,
        model TEXT NOT NULL,
        remaining_set INTEGER NOT NULL,
        origin TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS daemon_meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        pid INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        last_tick_at TEXT
    );

    CREATE TABLE IF NOT EXISTS auto_template_runs (
        task_type TEXT PRIMARY KEY,
        last_completed_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS budget_days (
        day TEXT PRIMARY KEY,
        spent_usd REAL NOT NULL DEFAULT 0
    );
";

/// Thread-safe database wrapper
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the task database and initialize tables
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "Opening task store");
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL mode for concurrent CLI readers while the daemon writes
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── tasks ────────────────────────────────────────────────────────────

    /// Insert a task; returns None when `(source, source_ref)` already exists
    pub fn create_task(&self, new: &NewTask) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tasks
                 (title, description, source, source_ref, requested_model,
                  priority, status, work_dir, created_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, 0)",
            params![
                new.title,
                new.description,
                new.source.as_str(),
                new.source_ref,
                new.requested_model.as_str(),
                new.priority,
                new.work_dir.to_string_lossy(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            debug!(
                source = new.source.as_str(),
                source_ref = ?new.source_ref,
                "Task already known, skipping"
            );
            return Ok(None);
        }

        let id = conn.last_insert_rowid();
        let task = query_task(&conn, id)?.ok_or_else(|| {
            MagpieError::Config(format!("task {id} vanished immediately after insert"))
        })?;
        info!(id, title = %task.title, source = %task.source, "Created task");
        Ok(Some(task))
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        query_task(&conn, id)
    }

    /// Update a task's status, enforcing lifecycle legality
    pub fn update_task_status(&self, id: i64, next: TaskStatus) -> Result<()> {
        let conn = self.conn.lock();
        let current = query_task(&conn, id)?
            .ok_or_else(|| MagpieError::Config(format!("no such task: {id}")))?;
        if !current.status.can_transition_to(next) {
            return Err(MagpieError::IllegalTransition {
                id,
                from: current.status,
                to: next,
            });
        }
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![next.as_str(), id],
        )?;
        debug!(id, from = %current.status, to = %next, "Task status changed");
        Ok(())
    }

    pub fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let limit = i64::from(filter.limit.unwrap_or(200));
        let mut tasks = Vec::new();
        match filter.status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks WHERE status = ?1
                     ORDER BY priority DESC, id ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![status.as_str(), limit], task_from_row)?;
                for row in rows {
                    tasks.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks ORDER BY priority DESC, id ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], task_from_row)?;
                for row in rows {
                    tasks.push(row??);
                }
            }
        }
        Ok(tasks)
    }

    /// Atomically claim the highest-priority pending task (FIFO on ties)
    ///
    /// Runs in an IMMEDIATE transaction so a concurrent claimer in another
    /// process cannot pick the same row. Returns the task already marked
    /// running with `started_at` set.
    pub fn claim_next_pending(&self) -> Result<Option<Task>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM tasks WHERE status = 'pending'
                 ORDER BY priority DESC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = id else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if changed != 1 {
            // Raced with another claimer; treat as nothing pending this tick
            warn!(id, "Pending task disappeared mid-claim");
            tx.rollback()?;
            return Ok(None);
        }

        let task = query_task(&tx, id)?;
        tx.commit()?;
        Ok(task)
    }

    /// Remove a task; running tasks are protected
    pub fn remove_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let task = query_task(&conn, id)?
            .ok_or_else(|| MagpieError::Config(format!("no such task: {id}")))?;
        if task.status == TaskStatus::Running {
            return Err(MagpieError::TaskBusy(id));
        }
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        info!(id, title = %task.title, "Removed task");
        Ok(())
    }

    /// Whether any task carries this dedup key
    pub fn has_task_with_source_ref(&self, source: TaskSource, source_ref: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE source = ?1 AND source_ref = ?2",
            params![source.as_str(), source_ref],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record the branch the executor created for a running task
    pub fn set_task_branch(&self, id: i64, branch: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET branch_name = ?1 WHERE id = ?2",
            params![branch, id],
        )?;
        Ok(())
    }

    /// Persist the executor outcome in one write
    pub fn set_task_finished(
        &self,
        id: i64,
        status: TaskStatus,
        summary: Option<&str>,
        cost_usd: Option<f64>,
    ) -> Result<()> {
        self.update_task_status(id, status)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET finished_at = ?1, result_summary = ?2, actual_cost_usd = ?3
             WHERE id = ?4",
            params![Utc::now().to_rfc3339(), summary, cost_usd, id],
        )?;
        Ok(())
    }

    /// Drop the branch column when the review workflow discards a branch
    pub fn clear_task_branch(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET branch_name = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Put a claimed task back without burning its retry count
    ///
    /// Used when a gate after the claim (quota, budget) refuses the
    /// dispatch; the task simply waits for a later tick.
    pub fn unclaim_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks
             SET status = 'pending', started_at = NULL, branch_name = NULL
             WHERE id = ?1 AND status = 'running'",
            params![id],
        )?;
        debug!(id, "Unclaimed task");
        Ok(())
    }

    /// Return orphaned `running` tasks to `pending` after a crash
    ///
    /// `retry_count` is bumped so a task that keeps killing the daemon is
    /// visible in `tasks list`; the claim order is unaffected.
    pub fn sweep_orphan_running(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let swept = conn.execute(
            "UPDATE tasks
             SET status = 'pending', started_at = NULL, branch_name = NULL,
                 retry_count = retry_count + 1
             WHERE status = 'running'",
            [],
        )?;
        if swept > 0 {
            warn!(swept, "Swept orphaned running tasks back to pending");
        }
        Ok(swept)
    }

    // ── usage samples ────────────────────────────────────────────────────

    pub fn record_usage_sample(&self, observed_at: DateTime<Utc>, active: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO usage_samples (observed_at, active) VALUES (?1, ?2)",
            params![observed_at.to_rfc3339(), i64::from(active)],
        )?;
        Ok(())
    }

    /// Samples newer than `days` days, oldest first
    pub fn list_recent_samples(&self, days: u32) -> Result<Vec<UsageSample>> {
        let cutoff = (Utc::now() - Duration::days(i64::from(days))).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT observed_at, active FROM usage_samples
             WHERE observed_at >= ?1 ORDER BY observed_at ASC",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            let observed_at: String = row.get(0)?;
            let active: i64 = row.get(1)?;
            Ok((observed_at, active != 0))
        })?;
        let mut samples = Vec::new();
        for row in rows {
            let (raw, active) = row?;
            samples.push(UsageSample {
                observed_at: parse_ts(&raw)?,
                active,
            });
        }
        Ok(samples)
    }

    /// Most recent sample with `active = true`
    pub fn last_active_sample_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT observed_at FROM usage_samples WHERE active = 1
                 ORDER BY observed_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| parse_ts(&r)).transpose()
    }

    /// Delete samples older than the retention horizon
    pub fn prune_samples(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(i64::from(older_than_days))).to_rfc3339();
        let conn = self.conn.lock();
        let pruned = conn.execute(
            "DELETE FROM usage_samples WHERE observed_at < ?1",
            params![cutoff],
        )?;
        Ok(pruned)
    }

    // ── quota window ─────────────────────────────────────────────────────

    /// Fetch the window, creating a fresh one on first use
    pub fn get_quota_window(&self) -> Result<QuotaWindow> {
        let conn = self.conn.lock();
        ensure_window_row(&conn)?;
        read_window(&conn)
    }

    pub fn record_quota_consumption(&self, tier: ModelTier, n: u32) -> Result<()> {
        let conn = self.conn.lock();
        ensure_window_row(&conn)?;
        conn.execute(
            &format!(
                "UPDATE quota_window SET {col} = {col} + ?1 WHERE id = 1",
                col = consumed_column(tier)
            ),
            params![n],
        )?;
        Ok(())
    }

    /// Undo a consumption after a failed dispatch
    pub fn refund_quota(&self, tier: ModelTier, n: u32) -> Result<()> {
        let conn = self.conn.lock();
        ensure_window_row(&conn)?;
        conn.execute(
            &format!(
                "UPDATE quota_window SET {col} = MAX(0, {col} - ?1) WHERE id = 1",
                col = consumed_column(tier)
            ),
            params![n],
        )?;
        Ok(())
    }

    /// Overwrite a tier's consumed count (operator or upstream correction)
    pub fn set_quota_consumed(
        &self,
        tier: ModelTier,
        consumed: u32,
        remaining_set: u32,
        origin: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        ensure_window_row(&conn)?;
        conn.execute(
            &format!(
                "UPDATE quota_window SET {col} = ?1, last_correction_at = ?2 WHERE id = 1",
                col = consumed_column(tier)
            ),
            params![consumed, now],
        )?;
        conn.execute(
            "INSERT INTO quota_corrections (applied_at, model, remaining_set, origin)
             VALUES (?1, ?2, ?3, ?4)",
            params![now, tier.as_str(), remaining_set, origin],
        )?;
        info!(model = %tier, consumed, origin, "Applied quota correction");
        Ok(())
    }

    pub fn list_quota_corrections(&self, limit: u32) -> Result<Vec<QuotaCorrection>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT applied_at, model, remaining_set, origin FROM quota_corrections
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut corrections = Vec::new();
        for row in rows {
            let (applied_at, model, remaining_set, origin) = row?;
            corrections.push(QuotaCorrection {
                applied_at: parse_ts(&applied_at)?,
                model: ModelTier::from_str(&model)
                    .map_err(MagpieError::Config)?,
                remaining_set: remaining_set.max(0) as u32,
                origin,
            });
        }
        Ok(corrections)
    }

    /// Roll the window forward if its length has elapsed; returns true on roll
    ///
    /// Advances `window_started_at` by whole windows so a daemon that slept
    /// through several windows lands on the current one, and resets counts.
    pub fn roll_quota_window_if_due(&self, now: DateTime<Utc>, window_hours: u32) -> Result<bool> {
        let conn = self.conn.lock();
        ensure_window_row(&conn)?;
        let window = read_window(&conn)?;
        let length = Duration::hours(i64::from(window_hours));
        let elapsed = now - window.window_started_at;
        if elapsed < length {
            return Ok(false);
        }

        let windows_past = elapsed.num_seconds() / length.num_seconds();
        let new_start = window.window_started_at + length * (windows_past as i32);
        conn.execute(
            "UPDATE quota_window
             SET window_started_at = ?1,
                 opus_consumed = 0, sonnet_consumed = 0, haiku_consumed = 0
             WHERE id = 1",
            params![new_start.to_rfc3339()],
        )?;
        info!(new_start = %new_start, "Rolled quota window");
        Ok(true)
    }

    /// Backdate the window start so roll/upgrade paths can be exercised
    #[cfg(test)]
    pub fn set_window_started_at(&self, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        ensure_window_row(&conn)?;
        conn.execute(
            "UPDATE quota_window SET window_started_at = ?1 WHERE id = 1",
            params![at.to_rfc3339()],
        )?;
        Ok(())
    }

    // ── budget ───────────────────────────────────────────────────────────

    /// USD spent on the given UTC day (`YYYY-MM-DD`)
    pub fn daily_spend(&self, day: &str) -> Result<f64> {
        let conn = self.conn.lock();
        let spent: Option<f64> = conn
            .query_row(
                "SELECT spent_usd FROM budget_days WHERE day = ?1",
                params![day],
                |row| row.get(0),
            )
            .optional()?;
        Ok(spent.unwrap_or(0.0))
    }

    pub fn record_spend(&self, day: &str, usd: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO budget_days (day, spent_usd) VALUES (?1, ?2)
             ON CONFLICT(day) DO UPDATE SET spent_usd = spent_usd + ?2",
            params![day, usd],
        )?;
        Ok(())
    }

    // ── daemon meta ──────────────────────────────────────────────────────

    pub fn set_daemon_meta(&self, pid: u32, started_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO daemon_meta (id, pid, started_at, last_tick_at)
             VALUES (1, ?1, ?2, NULL)
             ON CONFLICT(id) DO UPDATE SET pid = ?1, started_at = ?2, last_tick_at = NULL",
            params![pid, started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn touch_last_tick(&self, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE daemon_meta SET last_tick_at = ?1 WHERE id = 1",
            params![at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_daemon_meta(&self) -> Result<Option<DaemonMeta>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT pid, started_at, last_tick_at FROM daemon_meta WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((pid, started_at, last_tick_at)) = row else {
            return Ok(None);
        };
        Ok(Some(DaemonMeta {
            pid: pid.max(0) as u32,
            started_at: parse_ts(&started_at)?,
            last_tick_at: last_tick_at.map(|r| parse_ts(&r)).transpose()?,
        }))
    }

    // ── auto-template runs ───────────────────────────────────────────────

    pub fn last_template_run(&self, task_type: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_completed_at FROM auto_template_runs WHERE task_type = ?1",
                params![task_type],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| parse_ts(&r)).transpose()
    }

    pub fn record_template_run(&self, task_type: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO auto_template_runs (task_type, last_completed_at) VALUES (?1, ?2)
             ON CONFLICT(task_type) DO UPDATE SET last_completed_at = ?2",
            params![task_type, at.to_rfc3339()],
        )?;
        Ok(())
    }
}

fn consumed_column(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Opus => "opus_consumed",
        ModelTier::Sonnet => "sonnet_consumed",
        ModelTier::Haiku => "haiku_consumed",
    }
}

fn ensure_window_row(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO quota_window (id, window_started_at) VALUES (1, ?1)",
        params![Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn read_window(conn: &Connection) -> Result<QuotaWindow> {
    let (started, opus, sonnet, haiku, corrected) = conn.query_row(
        "SELECT window_started_at, opus_consumed, sonnet_consumed, haiku_consumed,
                last_correction_at
         FROM quota_window WHERE id = 1",
        [],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        },
    )?;
    Ok(QuotaWindow {
        window_started_at: parse_ts(&started)?,
        opus_consumed: opus.max(0) as u32,
        sonnet_consumed: sonnet.max(0) as u32,
        haiku_consumed: haiku.max(0) as u32,
        last_correction_at: corrected.map(|r| parse_ts(&r)).transpose()?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MagpieError::Config(format!("bad timestamp '{raw}' in store: {e}")))
}

type RowResult = std::result::Result<Result<Task>, rusqlite::Error>;

fn task_from_row(row: &rusqlite::Row<'_>) -> RowResult {
    let source: String = row.get("source")?;
    let status: String = row.get("status")?;
    let requested: String = row.get("requested_model")?;
    let work_dir: String = row.get("work_dir")?;
    let created_at: String = row.get("created_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let priority: i64 = row.get("priority")?;
    let retry_count: i64 = row.get("retry_count")?;
    let id: i64 = row.get("id")?;
    let title: String = row.get("title")?;
    let description: Option<String> = row.get("description")?;
    let source_ref: Option<String> = row.get("source_ref")?;
    let branch_name: Option<String> = row.get("branch_name")?;
    let actual_cost_usd: Option<f64> = row.get("actual_cost_usd")?;
    let result_summary: Option<String> = row.get("result_summary")?;

    Ok((|| -> Result<Task> {
        Ok(Task {
            id,
            title,
            description,
            source: TaskSource::from_str(&source).map_err(MagpieError::Config)?,
            source_ref,
            requested_model: RequestedModel::from_str(&requested)
                .map_err(MagpieError::Config)?,
            priority: priority.clamp(0, 100) as u8,
            status: TaskStatus::from_str(&status).map_err(MagpieError::Config)?,
            work_dir: PathBuf::from(work_dir),
            branch_name,
            created_at: parse_ts(&created_at)?,
            started_at: started_at.as_deref().map(parse_ts).transpose()?,
            finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
            actual_cost_usd,
            result_summary,
            retry_count: retry_count.max(0) as u32,
        })
    })())
}

fn query_task(conn: &Connection, id: i64) -> Result<Option<Task>> {
    conn.query_row(
        "SELECT * FROM tasks WHERE id = ?1",
        params![id],
        task_from_row,
    )
    .optional()?
    .transpose()
}
