//! CLI for catalog operations

use albumkv::common::{parse_duration, retry_with_backoff, Config};
use albumkv::ops::{demo_catalog, load_catalog_file, seed_catalog, verify_catalog};
use albumkv::{AlbumId, Coordinator, RedisStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "albumkv")]
#[command(about = "albumkv album catalog CLI")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./albumkv.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL, overriding the config
    #[arg(long, global = true)]
    redis: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load albums into the store
    Seed {
        /// Catalog file (TOML or JSON)
        #[arg(long, required_unless_present = "demo")]
        file: Option<PathBuf>,

        /// Load the built-in demo catalog
        #[arg(long, conflicts_with = "file")]
        demo: bool,
    },

    /// Show one album
    Get {
        /// Album id
        id: AlbumId,
    },

    /// Add a like to an album
    Like {
        /// Album id
        id: AlbumId,

        /// Attempts on connection failures
        #[arg(long, default_value = "3")]
        retries: usize,

        /// Delay before the first retry (e.g. "200ms")
        #[arg(long, default_value = "200ms", value_parser = parse_duration)]
        retry_delay: std::time::Duration,
    },

    /// List the most liked albums
    Top {
        #[arg(long, default_value = "3")]
        limit: usize,
    },

    /// Delete an album and its ranking entry
    Remove {
        /// Album id
        id: AlbumId,
    },

    /// Check that records and ranking agree
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis {
        config.store.url = url;
    }
    let store = RedisStore::open(&config.store, &config.pool)?;
    let coordinator = Coordinator::new(Arc::new(store), config.keyspace, config.topk);

    match cli.command {
        Commands::Seed { file, .. } => {
            // Without a file, clap has already required --demo.
            let albums = match file {
                Some(path) => load_catalog_file(&path)?,
                None => demo_catalog(),
            };
            let report = seed_catalog(&coordinator, &albums).await?;
            println!("Seeded {} albums", report.inserted);
        }

        Commands::Get { id } => {
            let album = coordinator.get(id).await?;
            println!("{album}");
        }

        Commands::Like {
            id,
            retries,
            retry_delay,
        } => {
            let likes =
                retry_with_backoff(|| coordinator.like(id), retries.max(1), retry_delay).await?;
            println!("Album {id} now has {likes} likes");
        }

        Commands::Top { limit } => {
            for (rank, album) in coordinator.top(limit).await?.iter().enumerate() {
                println!("{}) {}", rank + 1, album);
            }
        }

        Commands::Remove { id } => {
            coordinator.remove(id).await?;
            println!("Removed album {id}");
        }

        Commands::Verify => {
            let report = verify_catalog(&coordinator).await?;
            println!("Verification report:");
            println!("  Total records: {}", report.total_records);
            println!("  Ranked: {}", report.ranked);
            println!("  Healthy: {}", report.healthy);
            println!("  Score mismatch: {}", report.score_mismatch);
            println!("  Orphan ranks: {}", report.orphan_ranks);
            println!("  Unranked records: {}", report.unranked_records);
            println!("  Corrupted: {}", report.corrupted);
            for problem in &report.problems {
                println!("  - {problem}");
            }
            if !report.is_consistent() {
                anyhow::bail!("catalog is inconsistent");
            }
        }
    }

    Ok(())
}
