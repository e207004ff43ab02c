//! Common utilities and types shared across albumkv

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    Config, Keyspace, PoolConfig, ServerConfig, StoreBackend, StoreConfig, TopKConfig,
    TopKStrategy,
};
pub use error::{Error, Result};
pub use utils::{parse_duration, retry_with_backoff};
