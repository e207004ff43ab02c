//! # albumkv
//!
//! An album catalog on Redis with:
//! - Album records stored as hashes (`album:{id}`)
//! - A global popularity ranking in one sorted set (`likes`)
//! - Atomic like increments that update both structures or neither
//! - Consistent top-K reads, by server-side script or WATCH/MULTI/EXEC
//! - A bounded connection pool and an in-memory backend for tests
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            HTTP surface (axum)          │
//! │   /album  /like  /popular  /api/...     │
//! └───────────┬─────────────────────────────┘
//!             │
//! ┌───────────▼─────────────────────────────┐
//! │         Consistency coordinator         │
//! │   get · like · top · insert · remove    │
//! └───────────┬─────────────────────────────┘
//!             │ Store / Session
//!   ┌─────────┴──────────┐
//!   │                    │
//! ┌─▼──────────┐   ┌─────▼──────┐
//! │ RedisStore │   │ MemoryStore│
//! │ Lua + WATCH│   │ one mutex  │
//! └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the server
//! ```bash
//! albumkv-server serve \
//!   --bind 0.0.0.0:4000 \
//!   --redis redis://127.0.0.1:6379 \
//!   --seed ./catalog.toml
//! ```
//!
//! ### Use the CLI
//! ```bash
//! albumkv seed --demo
//! albumkv get 2
//! albumkv like 2
//! albumkv top --limit 3
//! albumkv verify
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Album, AlbumId, Coordinator, Price, Server};
pub use store::{MemoryStore, RedisStore, Store};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
