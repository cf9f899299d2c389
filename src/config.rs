//! Configuration loading and the config-directory layout
//!
//! Settings live in `config.toml` inside the wise-magpie config directory
//! (next to the task database, pid file, and daemon log). Parsing goes
//! through serde + toml with per-field defaults so a partial file is fine;
//! a missing or malformed file is a hard error surfaced to the CLI.

use crate::errors::{MagpieError, Result};
use crate::task::ModelTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable that overrides the config directory location
pub const CONFIG_DIR_ENV: &str = "CONFIG_DIR_OVERRIDE";

/// Resolved config-directory layout
#[derive(Debug, Clone)]
pub struct ConfigDir {
    pub root: PathBuf,
}

impl ConfigDir {
    /// Resolve the config directory: env override first, then the platform
    /// config location, then `~/.wise-magpie` as a last resort.
    pub fn resolve() -> Self {
        let root = std::env::var_os(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| {
                directories::ProjectDirs::from("", "", "wise-magpie")
                    .map(|dirs| dirs.config_dir().to_path_buf())
            })
            .unwrap_or_else(|| PathBuf::from(".wise-magpie"));
        Self { root }
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn db_file(&self) -> PathBuf {
        self.root.join("assistant-tasks.db")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("assistant.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("assistant.log")
    }

    pub fn ensure_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub quota: QuotaConfig,
    pub budget: BudgetConfig,
    pub activity: ActivityConfig,
    pub daemon: DaemonConfig,
    pub assistant: AssistantConfig,
    pub auto_tasks: AutoTasksConfig,
    pub notify: NotifyConfig,
}

/// Rolling quota window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    /// Rolling window length in hours
    pub window_hours: u32,
    /// Fraction of each limit reserved for interactive use
    pub safety_margin: f64,
    /// Per-model message limits within one window
    pub limits: QuotaLimits,
    /// Upstream endpoint for `quota sync`; absent disables sync
    pub sync_url: Option<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_hours: 5,
            safety_margin: 0.15,
            limits: QuotaLimits::default(),
            sync_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaLimits {
    pub opus: u32,
    pub sonnet: u32,
    pub haiku: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            opus: 45,
            sonnet: 225,
            haiku: 900,
        }
    }
}

impl QuotaLimits {
    pub fn for_tier(&self, tier: ModelTier) -> u32 {
        match tier {
            ModelTier::Opus => self.opus,
            ModelTier::Sonnet => self.sonnet,
            ModelTier::Haiku => self.haiku,
        }
    }
}

/// USD spend caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    pub max_task_usd: f64,
    pub max_daily_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_task_usd: 2.0,
            max_daily_usd: 10.0,
        }
    }
}

/// Idle detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActivityConfig {
    /// Minutes without a presence signal before the operator counts as idle
    pub idle_threshold_minutes: u32,
    /// Skip dispatch when the predictor expects a return within this window
    pub return_buffer_minutes: u32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_threshold_minutes: 30,
            return_buffer_minutes: 15,
        }
    }
}

/// Daemon loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Seconds between ticks
    pub poll_interval: u64,
    /// Minutes between upstream quota syncs; 0 disables
    pub auto_sync_interval_minutes: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            auto_sync_interval_minutes: 30,
        }
    }
}

/// Assistant CLI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssistantConfig {
    /// Executable name or path of the Assistant CLI
    pub binary: String,
    /// Default tier when auto-selection is off or classification is moot
    pub model: String,
    /// Let the policy pick the tier from task difficulty
    pub auto_select_model: bool,
    /// Extra flags appended to every invocation
    pub extra_flags: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: "sonnet".to_string(),
            auto_select_model: true,
            extra_flags: Vec::new(),
        }
    }
}

impl AssistantConfig {
    /// Default tier parsed from `model`; full model ids fall back to sonnet
    pub fn default_tier(&self) -> ModelTier {
        self.model.parse().unwrap_or(ModelTier::Sonnet)
    }
}

/// Auto-template task generation
///
/// `deny_unknown_fields` is incompatible with the flattened override map, so
/// unknown keys under `[auto_tasks]` are parsed as template overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTasksConfig {
    pub enabled: bool,
    /// Repository the template gate inspects; manual tasks may carry their own
    pub work_dir: Option<PathBuf>,
    /// Per-template overrides keyed by task_type
    #[serde(flatten)]
    pub templates: HashMap<String, TemplateOverride>,
}

impl AutoTasksConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn override_for(&self, task_type: &str) -> Option<&TemplateOverride> {
        self.templates.get(task_type)
    }
}

/// Overrides the built-in defaults of one template row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateOverride {
    pub enabled: Option<bool>,
    pub interval_hours: Option<u32>,
    pub min_commits: Option<u32>,
}

/// Desktop notifications on task completion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub enabled: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load and validate the config file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MagpieError::Config(format!(
                "{} not found; run `wise-magpie config init` first",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| MagpieError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quota.safety_margin) {
            return Err(MagpieError::Config(
                "quota.safety_margin must be between 0 and 1".to_string(),
            ));
        }
        if self.quota.window_hours == 0 {
            return Err(MagpieError::Config(
                "quota.window_hours must be at least 1".to_string(),
            ));
        }
        if self.daemon.poll_interval == 0 {
            return Err(MagpieError::Config(
                "daemon.poll_interval must be at least 1 second".to_string(),
            ));
        }
        if let Some(url) = &self.quota.sync_url {
            url::Url::parse(url)
                .map_err(|e| MagpieError::Config(format!("quota.sync_url invalid: {e}")))?;
        }
        Ok(())
    }

    /// Render the commented default file `config init` writes
    pub fn default_file_contents() -> String {
        let defaults = QuotaLimits::default();
        format!(
            r#"# wise-magpie configuration
# All keys are optional; the values below are the defaults.

[quota]
window_hours = 5
safety_margin = 0.15
# sync_url = "https://example.invalid/quota"

[quota.limits]
opus = {opus}
sonnet = {sonnet}
haiku = {haiku}

[budget]
max_task_usd = 2.0
max_daily_usd = 10.0

[activity]
idle_threshold_minutes = 30
return_buffer_minutes = 15

[daemon]
poll_interval = 60
auto_sync_interval_minutes = 30

[assistant]
binary = "claude"
model = "sonnet"
auto_select_model = true
extra_flags = []

[notify]
enabled = true

[auto_tasks]
enabled = false
# work_dir = "/path/to/repo"

# Per-template overrides, e.g.:
# [auto_tasks.run_tests]
# enabled = true
# interval_hours = 12
"#,
            opus = defaults.opus,
            sonnet = defaults.sonnet,
            haiku = defaults.haiku,
        )
    }
}
