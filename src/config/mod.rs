use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

use crate::policy::BypassList;
use crate::quota::engine::QuotaPolicy;

const DEFAULT_MAX_QUOTA: u8 = 3;
const DEFAULT_RESTORE_WINDOW_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CACHE_TTL_MS: u64 = 5_000;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
const DEFAULT_EXAM_DURATION_SECS: u32 = 2 * 60 * 60;
const DEFAULT_BYPASS_DURATION_SECS: u32 = 2 * 60 * 60;
const DEFAULT_UNLOCK_FRACTION: f64 = 0.5;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

// ─── QuotaConfig ──────────────────────────────────────────────────────────────

/// Lives-quota policy (`[quota]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Quota ceiling per subject. Default: 3.
    pub max_quota: u8,
    /// Seconds until a deducted unit is restored. Default: 86400 (24 h).
    pub restore_window_secs: u64,
    /// How long a cached record stays fresh (milliseconds). Default: 5000.
    pub cache_ttl_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_quota: DEFAULT_MAX_QUOTA,
            restore_window_secs: DEFAULT_RESTORE_WINDOW_SECS,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
        }
    }
}

impl QuotaConfig {
    pub fn policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            max_quota: self.max_quota,
            restore_window: chrono::Duration::seconds(self.restore_window_secs as i64),
        }
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.cache_ttl_ms as i64)
    }
}

// ─── ExamConfig ───────────────────────────────────────────────────────────────

/// Exam session policy (`[exam]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExamConfig {
    /// Standard session duration in seconds. Default: 7200 (2 h).
    pub duration_secs: u32,
    /// Grace period after a focus-loss violation. Default: 10 s.
    pub grace_period_secs: u64,
    /// Fraction of the total duration before submit unlocks. Default: 0.5.
    pub unlock_fraction: f64,
    /// Identities exempt from violation detection (matched
    /// case-insensitively).
    pub bypass_identities: Vec<String>,
    /// Session duration substituted for bypassed identities. Default: 7200.
    pub bypass_duration_secs: u32,
    /// Session tick cadence in milliseconds. Default: 1000.
    pub tick_interval_ms: u64,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_EXAM_DURATION_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            unlock_fraction: DEFAULT_UNLOCK_FRACTION,
            bypass_identities: vec![],
            bypass_duration_secs: DEFAULT_BYPASS_DURATION_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl ExamConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_period_secs as i64)
    }

    pub fn bypass_list(&self) -> BypassList {
        BypassList::new(self.bypass_identities.iter().cloned())
    }

    /// The frozen total duration for a session: the bypass duration for
    /// exempt identities, the standard duration otherwise. Resolved at
    /// session construction, before `start()`.
    pub fn resolved_duration_secs(&self, bypassed: bool) -> u32 {
        if bypassed {
            self.bypass_duration_secs
        } else {
            self.duration_secs
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,proctord=trace".
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json".
    log_format: Option<String>,
    /// Log SQLite queries slower than this (milliseconds). 0 = disabled.
    slow_query_threshold_ms: Option<u64>,
    /// Lives-quota policy (`[quota]`).
    quota: Option<QuotaConfig>,
    /// Exam session policy (`[exam]`).
    exam: Option<ExamConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── ProctorConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProctorConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" (default) | "json" (structured for log aggregators).
    pub log_format: String,
    /// Slow-query log threshold in milliseconds (0 = disabled).
    pub slow_query_threshold_ms: u64,
    pub quota: QuotaConfig,
    pub exam: ExamConfig,
}

impl ProctorConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let log_format = std::env::var("PROCTORD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let slow_query_threshold_ms = toml.slow_query_threshold_ms.unwrap_or(0);
        let quota = toml.quota.unwrap_or_default();
        let exam = toml.exam.unwrap_or_default();

        Self {
            data_dir,
            log,
            log_format,
            slow_query_threshold_ms,
            quota,
            exam,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/proctord
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("proctord");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/proctord or ~/.local/share/proctord
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("proctord");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("proctord");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\proctord
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("proctord");
        }
    }
    // Fallback
    PathBuf::from(".proctord")
}
