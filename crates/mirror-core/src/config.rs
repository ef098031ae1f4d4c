use crate::error::{MirrorError, Result};
use crate::paths;
use crate::schedule::Schedule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RateLimitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Directory holding the shared state and lock files. Every cooperating
    /// process must point at the same directory.
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_acquire_timeout_secs() -> u64 {
    60
}

fn default_shared_dir() -> PathBuf {
    PathBuf::from(paths::RATE_LIMIT_DIR)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            window_secs: default_window_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            shared_dir: default_shared_dir(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// RefreshConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_blue_green")]
    pub blue_green_enabled: bool,
    #[serde(default = "default_schedule")]
    pub default_schedule: String,
    #[serde(default = "default_scope")]
    pub default_scope: String,
    /// Export directory standing in for the upstream read API
    /// (`<upstream_dir>/<endpoint>/<record_id>.json`).
    #[serde(default = "default_upstream_dir")]
    pub upstream_dir: PathBuf,
}

fn default_blue_green() -> bool {
    true
}

fn default_schedule() -> String {
    "daily".to_string()
}

fn default_scope() -> String {
    "all".to_string()
}

fn default_upstream_dir() -> PathBuf {
    PathBuf::from("upstream")
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            blue_green_enabled: default_blue_green(),
            default_schedule: default_schedule(),
            default_scope: default_scope(),
            upstream_dir: default_upstream_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            rate_limit: RateLimitConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(MirrorError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.rate_limit.requests_per_minute == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "rate_limit.requests_per_minute is 0: every acquire would time out"
                    .to_string(),
            });
        }

        if self.rate_limit.window_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "rate_limit.window_secs must be greater than 0".to_string(),
            });
        } else if self.rate_limit.window_secs != 60 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "rate_limit.window_secs is {}: requests_per_minute will be enforced over a non-minute window",
                    self.rate_limit.window_secs
                ),
            });
        }

        if self.rate_limit.acquire_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "rate_limit.acquire_timeout_secs is 0: acquire never waits for budget"
                    .to_string(),
            });
        }

        if let Err(e) = self.refresh.default_schedule.parse::<Schedule>() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("refresh.default_schedule: {e}"),
            });
        }

        if self.refresh.default_scope.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "refresh.default_scope must not be empty".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
