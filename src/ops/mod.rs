//! Ops commands for catalog management

pub mod seed;
pub mod verify;

pub use seed::{demo_catalog, load_catalog_file, seed_catalog, CatalogFile, SeedReport};
pub use verify::{verify_catalog, VerifyReport};
