//! TOML configuration for agentbeat.
//!
//! A layered model: an explicit `--config` path, then the `AGENTBEAT_CONFIG`
//! environment variable, then `./agentbeat.toml`, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::queue::QueueName;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration shared by the scheduler and worker processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded agentbeat configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (the `--config` flag), which must load.
    /// 2. The path named by the `AGENTBEAT_CONFIG` environment variable.
    /// 3. `./agentbeat.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("AGENTBEAT_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AGENTBEAT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new("agentbeat.toml");
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Relational store holding the schedule table, execution records and run-log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Pool creation attempts before the process continues in degraded mode.
    pub connect_attempts: u32,
    pub connect_retry_delay_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/agentbeat.db"),
            connect_attempts: 5,
            connect_retry_delay_secs: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }
}

/// Queue database shared by the scheduler (producer) and workers (consumers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub path: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/broker.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    pub tick_secs: u64,
    /// Minimum seconds between two staleness checks against the store.
    pub reload_min_interval_secs: u64,
    /// Attempts per reload before falling back to an empty snapshot.
    pub reload_attempts: u32,
    /// TTL of a scheduled dispatch; a message older than this is dropped.
    pub dispatch_expires_secs: u64,
    /// Offset of the store's local time zone from UTC, in hours.
    pub store_utc_offset_hours: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            reload_min_interval_secs: 30,
            reload_attempts: 3,
            dispatch_expires_secs: 300,
            store_utc_offset_hours: 8,
        }
    }
}

impl SchedulerConfig {
    /// The store's local time zone as a fixed offset.
    pub fn store_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.store_utc_offset_hours * 3600).with_context(|| {
            format!(
                "store_utc_offset_hours out of range: {}",
                self.store_utc_offset_hours
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent task runners.
    pub concurrency: usize,
    /// Queues to consume, highest priority first.
    pub queues: Vec<QueueName>,
    pub poll_interval_ms: u64,
    /// A claimed message not acked within this long is handed out again.
    pub claim_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_timeout_secs.max(1) as i64)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queues: QueueName::ALL.to_vec(),
            poll_interval_ms: 1000,
            claim_timeout_secs: 900,
        }
    }
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `user_name` sent to the agent runtime when a row does not name one.
    pub default_user: String,
    pub default_max_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_user: "scheduler".to_string(),
            default_max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub default_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// API / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}
