use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8280;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_LEASE_ID: &str = "jobkeeper";
pub const LEADER_CHECK_INTERVAL_SECS: u64 = 1;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 1;
pub const HEARTBEAT_EXPIRATION_SECS: u64 = 10; // lease is stale after this long without renewal
pub const TICK_INTERVAL_MS: u64 = 1_000;
pub const MAX_WORKERS: usize = 10;
pub const BATCH_SIZE: usize = 100;
pub const RETRY_INTERVAL_MS: u64 = 1_000;
pub const MAX_RETRIES: u32 = 3;
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (jobkeeper.toml + JOBKEEPER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobkeeperConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Which `JobRepository` implementation backs the instance.
///
/// Only `sqlite` is shared between instances; `memory` is meant for
/// single-node development and tests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub backend: StorageBackend,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            backend: StorageBackend::default(),
        }
    }
}

/// Leader election and dispatch loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Key of the lease record shared by every instance of one cluster.
    #[serde(default = "default_lease_id")]
    pub lease_id: String,
    /// How often a follower tries to claim the lease.
    #[serde(default = "default_leader_check_interval")]
    pub leader_check_interval_secs: u64,
    /// How often the leader renews the lease.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// A lease whose last heartbeat is older than this may be taken over.
    #[serde(default = "default_heartbeat_expiration")]
    pub heartbeat_expiration_secs: u64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Upper bound on concurrently executing jobs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Maximum due jobs loaded per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Retry budget given to jobs submitted without one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Deadline applied to jobs submitted without an execution timeout.
    #[serde(default = "default_execution_timeout")]
    pub default_execution_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_id: default_lease_id(),
            leader_check_interval_secs: LEADER_CHECK_INTERVAL_SECS,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            heartbeat_expiration_secs: HEARTBEAT_EXPIRATION_SECS,
            tick_interval_ms: TICK_INTERVAL_MS,
            max_workers: MAX_WORKERS,
            batch_size: BATCH_SIZE,
            retry_interval_ms: RETRY_INTERVAL_MS,
            max_retries: MAX_RETRIES,
            default_execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
        }
    }
}

/// Outbound HTTP client settings used by the recipient executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_lease_id() -> String {
    DEFAULT_LEASE_ID.to_string()
}
fn default_leader_check_interval() -> u64 {
    LEADER_CHECK_INTERVAL_SECS
}
fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}
fn default_heartbeat_expiration() -> u64 {
    HEARTBEAT_EXPIRATION_SECS
}
fn default_tick_interval() -> u64 {
    TICK_INTERVAL_MS
}
fn default_max_workers() -> usize {
    MAX_WORKERS
}
fn default_batch_size() -> usize {
    BATCH_SIZE
}
fn default_retry_interval() -> u64 {
    RETRY_INTERVAL_MS
}
fn default_max_retries() -> u32 {
    MAX_RETRIES
}
fn default_execution_timeout() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_MS
}
fn default_user_agent() -> String {
    format!("jobkeeper/{}", env!("CARGO_PKG_VERSION"))
}
fn default_connect_timeout() -> u64 {
    2_000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobkeeper/jobkeeper.db", home)
}

impl JobkeeperConfig {
    /// Load config from a TOML file with JOBKEEPER_* env var overrides.
    ///
    /// Nested keys use a double underscore in the environment, e.g.
    /// `JOBKEEPER_SCHEDULER__MAX_WORKERS=4`. A missing file is not an error:
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::extract(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("JOBKEEPER_").split("__")),
        )
    }

    fn extract(figment: Figment) -> crate::error::Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| crate::error::JobkeeperError::Config(e.to_string()))?;
        config.scheduler.validate()?;
        Ok(config)
    }
}

impl SchedulerConfig {
    /// Reject settings the elector and dispatch loop cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid =
            |msg: &str| Err(crate::error::JobkeeperError::Config(format!("scheduler: {msg}")));
        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be positive");
        }
        if self.leader_check_interval_secs == 0 {
            return invalid("leader_check_interval_secs must be positive");
        }
        if self.heartbeat_interval_secs == 0 {
            return invalid("heartbeat_interval_secs must be positive");
        }
        // the leader must renew before a follower may consider the lease stale
        if self.heartbeat_interval_secs >= self.heartbeat_expiration_secs {
            return invalid("heartbeat_interval_secs must be below heartbeat_expiration_secs");
        }
        if self.max_workers == 0 {
            return invalid("max_workers must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobkeeper/jobkeeper.toml", home)
}
