use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTROL_STATE_CHECK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_TIMEOVER_CHECK_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_MAKER: &str = "once";

/// Top-level config (jobsched.toml + JOBSCHED_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobschedConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Which repository adapter backs the manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// In-process indexed store. Everything is lost on exit.
    Memory,
    /// SQLite file at `database.path`.
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_db_path(),
        }
    }
}

/// Background checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Re-delivery cadence for undelivered pause/resume/abort requests.
    #[serde(default = "default_control_interval")]
    pub control_state_check_interval_ms: u64,
    /// Cadence of the max-delay (timeover) scan.
    #[serde(default = "default_timeover_interval")]
    pub timeover_check_interval_ms: u64,
    #[serde(default = "bool_true")]
    pub control_state_check_enabled: bool,
    #[serde(default = "bool_true")]
    pub timeover_check_enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            control_state_check_interval_ms: DEFAULT_CONTROL_STATE_CHECK_INTERVAL_MS,
            timeover_check_interval_ms: DEFAULT_TIMEOVER_CHECK_INTERVAL_MS,
            control_state_check_enabled: true,
            timeover_check_enabled: true,
        }
    }
}

/// Instance generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Generate today's instances when the server starts (skipped if any exist).
    #[serde(default = "bool_true")]
    pub generate_on_start: bool,
    /// Maker used when a master's `schedule_type` matches nothing else.
    /// Empty string disables the fallback.
    #[serde(default = "default_maker")]
    pub default_maker: String,
    /// Treat the keys of `makers` as regular expressions when no exact key matches.
    #[serde(default)]
    pub regex_enabled: bool,
    /// Extra `schedule_type` → built-in maker name aliases.
    #[serde(default)]
    pub makers: HashMap<String, String>,
    /// JSON file holding the statically registered masters.
    pub masters_path: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            generate_on_start: true,
            default_maker: default_maker(),
            regex_enabled: false,
            makers: HashMap::new(),
            masters_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SequenceKind {
    /// Monotonic counter persisted in `sequence.path`.
    #[default]
    File,
    /// Time-ordered UUIDv7 strings; nothing is persisted.
    Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    #[serde(default)]
    pub kind: SequenceKind,
    #[serde(default = "default_sequence_path")]
    pub path: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            kind: SequenceKind::default(),
            path: default_sequence_path(),
        }
    }
}

/// When enabled, the monitor only runs while this process holds leadership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn bool_true() -> bool {
    true
}
fn default_control_interval() -> u64 {
    DEFAULT_CONTROL_STATE_CHECK_INTERVAL_MS
}
fn default_timeover_interval() -> u64 {
    DEFAULT_TIMEOVER_CHECK_INTERVAL_MS
}
fn default_maker() -> String {
    DEFAULT_MAKER.to_string()
}
fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_db_path() -> String {
    format!("{}/.jobsched/jobsched.db", home_dir())
}
fn default_sequence_path() -> String {
    format!("{}/.jobsched/sequence", home_dir())
}

impl JobschedConfig {
    /// Load config from a TOML file with JOBSCHED_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `JOBSCHED_MONITOR__TIMEOVER_CHECK_INTERVAL_MS=5000`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBSCHED_").split("__"))
            .extract()
            .map_err(|e| crate::error::ConfigError::Invalid(e.to_string()))
    }
}

fn default_config_path() -> String {
    format!("{}/.jobsched/jobsched.toml", home_dir())
}
