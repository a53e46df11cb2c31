//! Configuration module for TwinSync.
//!
//! Provides typed configuration structs that map to the YAML job file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::Resolution;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration of one synchronization job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub job: JobConfig,
    pub filters: FilterConfig,
    pub conflicts: ConflictsConfig,
    pub logging: LoggingConfig,
    pub state: StateConfig,
}

/// Which way changes are allowed to flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local changes are pushed; the remote feed is not fetched.
    Up,
    /// Remote changes are pulled; local changes are discarded.
    Down,
    /// Both ways.
    Bi,
}

/// When cycles run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Every `online_interval_secs`.
    Auto,
    /// Only after an explicit start request.
    Manual,
    /// Once a day, in the minute after `start_time`.
    Time,
}

/// Whether the unnecessary-change filter bulk-stats the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnnecessaryChangePolicy {
    Always,
    /// Only on the job's first cycle after start.
    FirstRunOnly,
    Never,
}

/// Job scheduling and apply-phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Identifier that scopes all persisted state.
    pub id: String,
    /// Root of the local replica.
    pub local_root: PathBuf,
    pub direction: Direction,
    pub frequency: Frequency,
    /// `HH:MM`, used when `frequency` is `time`.
    pub start_time: Option<String>,
    /// Seconds between cycles while online.
    pub online_interval_secs: u64,
    /// Seconds between attempts while offline or blocked on conflicts.
    pub offline_interval_secs: u64,
    /// Upper bound on the wait for a local write burst to settle.
    pub event_wait_max_secs: u64,
    /// Number of concurrent file operations in the apply phase.
    pub pool_size: usize,
    /// Directories created per bulk mkdir call.
    pub mkdir_batch_size: usize,
    /// Pause after each successful file operation.
    pub pacing_ms: u64,
    /// Random extra pause added to `pacing_ms`.
    pub pacing_jitter_ms: u64,
    pub unnecessary_changes: UnnecessaryChangePolicy,
}

/// Include/exclude glob filters applied to every change path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Empty means everything is included.
    pub includes: Vec<String>,
    /// Excludes win over includes.
    pub excludes: Vec<String>,
}

/// Conflict strategy: resolve automatically or wait for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Manual,
    KeepLocal,
    KeepRemote,
    KeepBoth,
}

impl Strategy {
    /// The resolution to apply automatically, `None` for manual.
    pub fn resolution(self) -> Option<Resolution> {
        match self {
            Strategy::Manual => None,
            Strategy::KeepLocal => Some(Resolution::KeepLocal),
            Strategy::KeepRemote => Some(Resolution::KeepRemote),
            Strategy::KeepBoth => Some(Resolution::KeepBoth),
        }
    }
}

/// A per-pattern conflict strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRule {
    /// Glob pattern matched against the workspace path (e.g. `*.docx`).
    pub pattern: String,
    pub strategy: Strategy,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    pub default_strategy: Strategy,
    /// Evaluated in order; the first match wins.
    pub rules: Vec<ConflictRule>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Path to the SQLite state database.
    pub database: PathBuf,
    /// Failure entries kept per job; older ones are dropped.
    pub failure_history: u32,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/twinsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("twinsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            local_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("TwinSync"),
            direction: Direction::Bi,
            frequency: Frequency::Auto,
            start_time: None,
            online_interval_secs: 10,
            offline_interval_secs: 60,
            event_wait_max_secs: 30,
            pool_size: 4,
            mkdir_batch_size: 10,
            pacing_ms: 50,
            pacing_jitter_ms: 50,
            unnecessary_changes: UnnecessaryChangePolicy::Always,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: vec![
                "*/.DS_Store".to_string(),
                "*/Thumbs.db".to_string(),
                "*.twinsync_part".to_string(),
            ],
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Manual,
            rules: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            database: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("twinsync")
                .join("state.db"),
            failure_history: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"job.pool_size"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Parses `HH:MM` into hour and minute.
pub fn parse_start_time(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            });
        };

        // --- job ---
        if self.job.id.trim().is_empty() {
            push("job.id", "must not be empty".into());
        }
        if self.job.online_interval_secs == 0 {
            push("job.online_interval_secs", "must be greater than 0".into());
        }
        if self.job.offline_interval_secs == 0 {
            push("job.offline_interval_secs", "must be greater than 0".into());
        }
        if self.job.pool_size == 0 {
            push("job.pool_size", "must be greater than 0".into());
        }
        if self.job.mkdir_batch_size == 0 {
            push("job.mkdir_batch_size", "must be greater than 0".into());
        }
        match (&self.job.frequency, &self.job.start_time) {
            (Frequency::Time, None) => {
                push("job.start_time", "required when frequency is 'time'".into());
            }
            (_, Some(t)) if parse_start_time(t).is_none() => {
                push("job.start_time", format!("expected HH:MM, got '{t}'"));
            }
            _ => {}
        }

        // --- filters ---
        for (i, pattern) in self
            .filters
            .includes
            .iter()
            .chain(self.filters.excludes.iter())
            .enumerate()
        {
            if pattern.trim().is_empty() {
                push("filters", format!("pattern #{i} is empty"));
            }
        }

        // --- conflicts ---
        for (i, rule) in self.conflicts.rules.iter().enumerate() {
            if rule.pattern.trim().is_empty() {
                push(
                    &format!("conflicts.rules[{i}].pattern"),
                    "must not be empty".into(),
                );
            }
        }

        // --- state ---
        if self.state.failure_history == 0 {
            push("state.failure_history", "must be greater than 0".into());
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}'; expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Config`], starting from defaults.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from [`Config::default`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- job ---

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.config.job.id = id.into();
        self
    }

    pub fn local_root(mut self, root: PathBuf) -> Self {
        self.config.job.local_root = root;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.config.job.direction = direction;
        self
    }

    pub fn frequency(mut self, frequency: Frequency) -> Self {
        self.config.job.frequency = frequency;
        self
    }

    pub fn start_time(mut self, start_time: impl Into<String>) -> Self {
        self.config.job.start_time = Some(start_time.into());
        self
    }

    pub fn online_interval_secs(mut self, seconds: u64) -> Self {
        self.config.job.online_interval_secs = seconds;
        self
    }

    pub fn offline_interval_secs(mut self, seconds: u64) -> Self {
        self.config.job.offline_interval_secs = seconds;
        self
    }

    pub fn event_wait_max_secs(mut self, seconds: u64) -> Self {
        self.config.job.event_wait_max_secs = seconds;
        self
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.config.job.pool_size = n;
        self
    }

    pub fn mkdir_batch_size(mut self, n: usize) -> Self {
        self.config.job.mkdir_batch_size = n;
        self
    }

    pub fn pacing(mut self, pacing_ms: u64, jitter_ms: u64) -> Self {
        self.config.job.pacing_ms = pacing_ms;
        self.config.job.pacing_jitter_ms = jitter_ms;
        self
    }

    pub fn unnecessary_changes(mut self, policy: UnnecessaryChangePolicy) -> Self {
        self.config.job.unnecessary_changes = policy;
        self
    }


    // --- filters ---

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.config.filters.includes.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.config.filters.excludes.push(pattern.into());
        self
    }

    // --- conflicts ---

    pub fn conflicts_default_strategy(mut self, strategy: Strategy) -> Self {
        self.config.conflicts.default_strategy = strategy;
        self
    }

    pub fn conflict_rule(mut self, pattern: impl Into<String>, strategy: Strategy) -> Self {
        self.config.conflicts.rules.push(ConflictRule {
            pattern: pattern.into(),
            strategy,
        });
        self
    }

    // --- logging / state ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    pub fn database(mut self, path: PathBuf) -> Self {
        self.config.state.database = path;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
