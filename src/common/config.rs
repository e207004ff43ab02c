//! Configuration for albumkv components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `ALBUMKV__POOL__MAX_SIZE=20`
pub const ENV_PREFIX: &str = "ALBUMKV";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP surface
    #[serde(default)]
    pub server: ServerConfig,

    /// Store backend and round-trip timeout
    #[serde(default)]
    pub store: StoreConfig,

    /// Connection pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Key layout inside the store
    #[serde(default)]
    pub keyspace: Keyspace,

    /// Leaderboard read strategy
    #[serde(default)]
    pub topk: TopKConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            pool: PoolConfig::default(),
            keyspace: Keyspace::default(),
            topk: TopKConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `ALBUMKV__*` overrides.
    ///
    /// Without an explicit path, `./albumkv.toml` is read when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("albumkv").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(Error::InvalidConfig("pool.max_size must be at least 1".into()));
        }
        if self.pool.max_idle > self.pool.max_size {
            return Err(Error::InvalidConfig(format!(
                "pool.max_idle ({}) exceeds pool.max_size ({})",
                self.pool.max_idle, self.pool.max_size
            )));
        }
        if self.topk.max_attempts == 0 {
            return Err(Error::InvalidConfig("topk.max_attempts must be at least 1".into()));
        }
        if self.keyspace.record_prefix.is_empty() || self.keyspace.ranking_key.is_empty() {
            return Err(Error::InvalidConfig("keyspace names must not be empty".into()));
        }
        if self.keyspace.ranking_key.starts_with(&self.keyspace.record_prefix) {
            return Err(Error::InvalidConfig(format!(
                "ranking key {:?} collides with record prefix {:?}",
                self.keyspace.ranking_key, self.keyspace.record_prefix
            )));
        }
        if self.server.popular_limit == 0 {
            return Err(Error::InvalidConfig("server.popular_limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Number of albums listed by `GET /popular`
    #[serde(default = "default_popular_limit")]
    pub popular_limit: usize,

    /// Catalog file loaded into the store before serving
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4000))
}
fn default_popular_limit() -> usize {
    3
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            popular_limit: default_popular_limit(),
            seed_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Upper bound on a single store round trip
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_response_timeout() -> u64 {
    2_000
}

impl StoreConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_redis_url(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections checked out at once
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Connections kept open while unused
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Idle connections older than this are closed on checkout
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Bounded wait for a free connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_max_size() -> usize {
    10
}
fn default_max_idle() -> usize {
    10
}
fn default_idle_timeout() -> u64 {
    240_000
}
fn default_acquire_timeout() -> u64 {
    1_000
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_idle: default_max_idle(),
            idle_timeout_ms: default_idle_timeout(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

/// Where records and the ranking index live in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    /// Record key is `{record_prefix}{id}`
    #[serde(default = "default_record_prefix")]
    pub record_prefix: String,

    /// Sorted set holding id → likes
    #[serde(default = "default_ranking_key")]
    pub ranking_key: String,
}

fn default_record_prefix() -> String {
    "album:".to_string()
}
fn default_ranking_key() -> String {
    "likes".to_string()
}

impl Keyspace {
    pub fn record_key(&self, member: &str) -> String {
        format!("{}{}", self.record_prefix, member)
    }

    /// Inverse of [`Keyspace::record_key`]
    pub fn member_of<'a>(&self, record_key: &'a str) -> Option<&'a str> {
        record_key.strip_prefix(self.record_prefix.as_str())
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self {
            record_prefix: default_record_prefix(),
            ranking_key: default_ranking_key(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopKStrategy {
    /// One server-side script reads ranks and records together
    Script,
    /// WATCH the ranking index, read, commit, restart on abort
    Optimistic,
}

/// Leaderboard read configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopKConfig {
    #[serde(default = "default_strategy")]
    pub strategy: TopKStrategy,

    /// Optimistic attempts before giving up with a conflict
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_strategy() -> TopKStrategy {
    TopKStrategy::Script
}
fn default_max_attempts() -> u32 {
    16
}

impl Default for TopKConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_attempts: default_max_attempts(),
        }
    }
}
