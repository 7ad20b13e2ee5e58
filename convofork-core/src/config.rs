//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/convofork/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/convofork/` (~/.config/convofork/)
//! - Data: `$XDG_DATA_HOME/convofork/` (~/.local/share/convofork/)
//! - State/Logs: `$XDG_STATE_HOME/convofork/` (~/.local/state/convofork/)

use crate::error::{Error, Result};
use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Branch classification settings
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Token estimation settings
    #[serde(default)]
    pub estimate: EstimateConfig,

    /// Pruning advisor thresholds
    #[serde(default)]
    pub advisor: AdvisorConfig,

    /// Backup storage
    #[serde(default)]
    pub backups: BackupConfig,

    /// Where session logs live
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Branch classification configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Hours since a branch's last message before it counts as abandoned
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            freshness_hours: default_freshness_hours(),
        }
    }
}

impl AnalysisConfig {
    /// Freshness window as a duration
    pub fn freshness_window(&self) -> Duration {
        Duration::hours(i64::from(self.freshness_hours))
    }
}

fn default_freshness_hours() -> u32 {
    24
}

/// Token estimation configuration
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct EstimateConfig {
    /// Add cache-write and cache-read counters to recorded usage
    #[serde(default)]
    pub include_cached_tokens: bool,

    /// Estimate from text when a message has no usage counters
    #[serde(default = "default_true")]
    pub estimate_if_missing: bool,

    /// Extra tokens charged for a message containing a tool invocation
    #[serde(default = "default_tool_overhead")]
    pub tool_overhead_tokens: u64,

    /// Characters per estimated token
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: u64,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            include_cached_tokens: false,
            estimate_if_missing: true,
            tool_overhead_tokens: default_tool_overhead(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tool_overhead() -> u64 {
    50
}

fn default_chars_per_token() -> u64 {
    4
}

/// Pruning advisor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AdvisorConfig {
    /// Age in days past which pruning is low risk and needs no confirmation
    #[serde(default = "default_stale_days")]
    pub stale_days: u32,

    /// Token weight above which an inactive branch is worth deactivating
    #[serde(default = "default_large_branch_tokens")]
    pub large_branch_tokens: u64,

    /// Maximum relative token difference for near-duplicate siblings
    #[serde(default = "default_duplicate_token_ratio")]
    pub duplicate_token_ratio: f64,

    /// Maximum message count difference for near-duplicate siblings
    #[serde(default = "default_duplicate_message_delta")]
    pub duplicate_message_delta: usize,

    /// Propose pruning abandoned branches; when off, large ones are deactivated instead
    #[serde(default = "default_true")]
    pub suggest_prune: bool,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            stale_days: default_stale_days(),
            large_branch_tokens: default_large_branch_tokens(),
            duplicate_token_ratio: default_duplicate_token_ratio(),
            duplicate_message_delta: default_duplicate_message_delta(),
            suggest_prune: true,
        }
    }
}

impl AdvisorConfig {
    /// Stale threshold as a duration
    pub fn stale_after(&self) -> Duration {
        Duration::days(i64::from(self.stale_days))
    }
}

fn default_stale_days() -> u32 {
    7
}

fn default_large_branch_tokens() -> u64 {
    50_000
}

fn default_duplicate_token_ratio() -> f64 {
    0.2
}

fn default_duplicate_message_delta() -> usize {
    3
}

/// Backup storage configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct BackupConfig {
    /// Override the backup directory
    pub dir: Option<PathBuf>,
}

/// Session log locations
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SourcesConfig {
    /// Override path for Claude Code's `projects` directory
    pub claude_projects_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.analysis.freshness_hours == 0 {
            return Err(Error::Config(
                "analysis.freshness_hours must be at least 1".to_string(),
            ));
        }
        if self.estimate.chars_per_token == 0 {
            return Err(Error::Config(
                "estimate.chars_per_token must be at least 1".to_string(),
            ));
        }
        let ratio = self.advisor.duplicate_token_ratio;
        if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
            return Err(Error::Config(
                "advisor.duplicate_token_ratio must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding branch backups (config override or default)
    pub fn backup_dir(&self) -> PathBuf {
        self.backups
            .dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("backups"))
    }

    /// Claude Code projects directory (config override or `~/.claude/projects`)
    pub fn claude_projects_dir(&self) -> PathBuf {
        self.sources
            .claude_projects_path
            .clone()
            .unwrap_or_else(|| home_dir().join(".claude").join("projects"))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/convofork/config.toml` (~/.config/convofork/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("convofork").join("config.toml")
    }

    /// Returns the data directory path (for backups)
    ///
    /// `$XDG_DATA_HOME/convofork/` (~/.local/share/convofork/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("convofork")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/convofork/` (~/.local/state/convofork/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("convofork")
    }

    /// Returns the log file the daily appender writes on `date` (UTC)
    ///
    /// `$XDG_STATE_HOME/convofork/convofork.YYYY-MM-DD.log`
    pub fn log_path(date: NaiveDate) -> PathBuf {
        Self::state_dir().join(format!("convofork.{}.log", date.format("%Y-%m-%d")))
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
