use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

// Periodic trigger cadence
pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_TICK_EXPIRY_SECS: u64 = 50; // a tick must finish well before the next one
// Dispatch
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 3_600; // broker drops unconsumed messages after this
pub const DEFAULT_LANE_CAPACITY: usize = 1_024;
// Janitor
pub const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 2 * 3_600;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Work definitions the engine can resolve a `template_ref` against.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Periodic trigger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two trigger ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Hard deadline for a single tick. Must be shorter than `tick_secs`.
    #[serde(default = "default_tick_expiry_secs")]
    pub tick_expiry_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            tick_expiry_secs: DEFAULT_TICK_EXPIRY_SECS,
        }
    }
}

/// Staleness detection and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_janitor_interval_secs")]
    pub interval_secs: u64,
    /// Running runs without progress for this long are failed.
    /// Must be at least `dispatch.message_ttl_secs`.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Terminal runs older than this are deleted. `0` disables retention cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_JANITOR_INTERVAL_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Time-to-live attached to every submission.
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Buffered submissions per queue lane before `submit` reports the lane as full.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
    /// Job type → queue overrides on top of the built-in routing table,
    /// e.g. `backup = "heavy"`. Keys and values are checked at startup.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            message_ttl_secs: DEFAULT_MESSAGE_TTL_SECS,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            routes: BTreeMap::new(),
        }
    }
}

/// A single work definition known to this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Opaque reference stored on schedules and runs.
    pub template_ref: String,
    /// Display name copied onto every run created from this template.
    pub name: String,
    /// Job type, e.g. "backup" or "scan". Selects the queue lane.
    pub job_type: String,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_tick_expiry_secs() -> u64 {
    DEFAULT_TICK_EXPIRY_SECS
}
fn default_janitor_interval_secs() -> u64 {
    DEFAULT_JANITOR_INTERVAL_SECS
}
fn default_stale_after_secs() -> u64 {
    DEFAULT_STALE_AFTER_SECS
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_message_ttl_secs() -> u64 {
    DEFAULT_MESSAGE_TTL_SECS
}
fn default_lane_capacity() -> usize {
    DEFAULT_LANE_CAPACITY
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would break the engine's timing guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(CoreError::Config("scheduler.tick_secs must be > 0".into()));
        }
        if self.scheduler.tick_expiry_secs == 0
            || self.scheduler.tick_expiry_secs >= self.scheduler.tick_secs
        {
            return Err(CoreError::Config(format!(
                "scheduler.tick_expiry_secs ({}) must be > 0 and < scheduler.tick_secs ({})",
                self.scheduler.tick_expiry_secs, self.scheduler.tick_secs
            )));
        }
        if self.janitor.interval_secs == 0 {
            return Err(CoreError::Config("janitor.interval_secs must be > 0".into()));
        }
        // A run can sit in the broker for a full TTL before a worker picks it up.
        if self.janitor.stale_after_secs < self.dispatch.message_ttl_secs {
            return Err(CoreError::Config(format!(
                "janitor.stale_after_secs ({}) must be >= dispatch.message_ttl_secs ({})",
                self.janitor.stale_after_secs, self.dispatch.message_ttl_secs
            )));
        }
        if self.dispatch.lane_capacity == 0 {
            return Err(CoreError::Config("dispatch.lane_capacity must be > 0".into()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
