//! Album catalog coordinator
//!
//! The coordinator is responsible for:
//! - Album lookup by id
//! - Atomic like increments across the record and the ranking index
//! - Consistent top-K reads of the ranking
//! - Bulk insert and removal of albums
//!
//! The HTTP surface and server bootstrap sit on top of it.

pub mod album;
pub mod catalog;
pub mod http;
pub mod server;

pub use album::{Album, AlbumId, Price};
pub use catalog::Coordinator;
pub use server::Server;
