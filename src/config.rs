//! WolfGalera Configuration
//!
//! This module provides configuration structures for the Galera
//! cluster router: seeds, discovery, selection and pool tuning.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::consistency::ConsistencyLevel;
use crate::policy::PolicyKind;

/// Main WolfGalera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Database credentials shared by every node
    pub database: DatabaseConfig,

    /// Cluster membership and selection configuration
    pub cluster: ClusterConfig,

    /// Discovery cycle configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Client pool tuning (one pool per active node)
    #[serde(default)]
    pub pool: PoolSettings,

    /// Status probe pool tuning (one pool per registered node)
    #[serde(default = "PoolSettings::status_defaults")]
    pub status_pool: PoolSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Database user
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name (optional - leave empty for server-wide connections)
    #[serde(default)]
    pub database: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seed node addresses (host:port). Accepts a list or a comma-separated string.
    #[serde(deserialize_with = "deserialize_seeds")]
    pub seeds: Vec<String>,

    /// Attempts made to resolve a selected node before giving up
    #[serde(default = "default_retries")]
    pub retries_to_get_connection: u32,

    /// Selection policy used when a caller does not supply one
    #[serde(default)]
    pub default_policy: PolicyKind,

    /// Consistency level applied to every plain connection
    #[serde(default)]
    pub consistency_level: Option<ConsistencyLevel>,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Discovery period in milliseconds
    #[serde(default = "default_discovery_period_ms")]
    pub period_ms: u64,

    /// Mark Donor/Desynced nodes as down so they never serve connections
    #[serde(default = "default_true")]
    pub ignore_donor: bool,
}

/// Pool tuning for a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Pool name prefix; the node host is appended
    #[serde(default = "default_pool_name")]
    pub name: String,

    /// Maximum connections per node
    #[serde(default = "default_max_connections")]
    pub max_connections_per_host: u32,

    /// Minimum idle connections per node (0 = same as max)
    #[serde(default)]
    pub min_connections_idle_per_host: u32,

    /// Time to wait for a pooled connection in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Idle connections are closed after this many milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Connections are recycled after this many milliseconds
    #[serde(default)]
    pub max_lifetime_ms: Option<u64>,

    /// Session autocommit
    #[serde(default = "default_true")]
    pub autocommit: bool,

    /// Session read-only transactions
    #[serde(default)]
    pub read_only: bool,

    /// Session transaction isolation (e.g. "READ COMMITTED")
    #[serde(default)]
    pub isolation_level: Option<String>,

    /// Report pool metrics to the listener after each discovery cycle
    #[serde(default)]
    pub metrics_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_retries() -> u32 {
    3
}

fn default_discovery_period_ms() -> u64 {
    2000
}

fn default_pool_name() -> String {
    "wolfgalera".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    1000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn deserialize_seeds<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seeds {
        List(Vec<String>),
        Joined(String),
    }

    let seeds = match Seeds::deserialize(deserializer)? {
        Seeds::List(list) => list,
        Seeds::Joined(joined) => parse_seeds(&joined),
    };
    Ok(seeds)
}

/// Split a comma-separated seed string, dropping blanks
pub fn parse_seeds(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            period_ms: default_discovery_period_ms(),
            ignore_donor: true,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            max_connections_per_host: default_max_connections(),
            min_connections_idle_per_host: 0,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: None,
            autocommit: true,
            read_only: false,
            isolation_level: None,
            metrics_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PoolSettings {
    /// Defaults for the dedicated status probe pool
    pub fn status_defaults() -> Self {
        Self {
            max_connections_per_host: 1,
            min_connections_idle_per_host: 1,
            ..Self::default()
        }
    }

    /// Effective minimum idle connections
    pub fn min_idle(&self) -> u32 {
        if self.min_connections_idle_per_host == 0 {
            self.max_connections_per_host
        } else {
            self.min_connections_idle_per_host
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_ms.map(Duration::from_millis)
    }

    /// Statements run on every freshly opened connection
    pub fn session_init_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();
        if !self.autocommit {
            statements.push("SET autocommit = 0".to_string());
        }
        if let Some(level) = &self.isolation_level {
            statements.push(format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level));
        }
        if self.read_only {
            statements.push("SET SESSION TRANSACTION READ ONLY".to_string());
        }
        statements
    }

    fn validate(&self, section: &str) -> crate::Result<()> {
        if self.max_connections_per_host == 0 {
            return Err(crate::Error::Config(format!(
                "{}.max_connections_per_host must be greater than zero",
                section
            )));
        }
        if self.min_connections_idle_per_host > self.max_connections_per_host {
            return Err(crate::Error::Config(format!(
                "{}.min_connections_idle_per_host cannot exceed max_connections_per_host",
                section
            )));
        }
        if let Some(level) = &self.isolation_level {
            const LEVELS: [&str; 4] = [
                "READ UNCOMMITTED",
                "READ COMMITTED",
                "REPEATABLE READ",
                "SERIALIZABLE",
            ];
            if !LEVELS.contains(&level.to_uppercase().as_str()) {
                return Err(crate::Error::Config(format!(
                    "{}.isolation_level '{}' is not a transaction isolation level",
                    section, level
                )));
            }
        }
        Ok(())
    }
}

impl RouterConfig {
    /// Build a configuration from seeds and credentials with every other value defaulted
    pub fn new(seeds: Vec<String>, database: DatabaseConfig) -> Self {
        Self {
            database,
            cluster: ClusterConfig {
                seeds,
                retries_to_get_connection: default_retries(),
                default_policy: PolicyKind::default(),
                consistency_level: None,
            },
            discovery: DiscoveryConfig::default(),
            pool: PoolSettings::default(),
            status_pool: PoolSettings::status_defaults(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RouterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.seeds.is_empty() {
            return Err(crate::Error::Config("cluster.seeds cannot be empty".into()));
        }

        if self.cluster.retries_to_get_connection == 0 {
            return Err(crate::Error::Config(
                "cluster.retries_to_get_connection must be at least 1".into(),
            ));
        }

        if self.discovery.period_ms == 0 {
            return Err(crate::Error::Config("discovery.period_ms cannot be zero".into()));
        }

        if self.database.user.is_empty() {
            return Err(crate::Error::Config("database.user cannot be empty".into()));
        }

        self.pool.validate("pool")?;
        self.status_pool.validate("status_pool")?;

        Ok(())
    }

    /// Get discovery period as Duration
    pub fn discovery_period(&self) -> Duration {
        Duration::from_millis(self.discovery.period_ms)
    }
}
