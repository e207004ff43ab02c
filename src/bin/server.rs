//! Catalog server binary

use albumkv::common::{Config, StoreBackend, TopKStrategy};
use albumkv::ops::demo_catalog;
use albumkv::Server;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "albumkv-server")]
#[command(about = "albumkv album catalog HTTP server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Script,
    Optimistic,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Config file (defaults to ./albumkv.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Redis URL
        #[arg(long, conflicts_with = "memory")]
        redis: Option<String>,

        /// Serve from an in-process store instead of Redis
        #[arg(long)]
        memory: bool,

        /// Catalog file (TOML or JSON) loaded before serving
        #[arg(long, conflicts_with = "demo")]
        seed: Option<PathBuf>,

        /// Load the built-in demo catalog before serving
        #[arg(long)]
        demo: bool,

        /// Top-K read strategy
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            redis,
            memory,
            seed,
            demo,
            strategy,
        } => {
            // File and environment first, then CLI flags on top
            let mut config = Config::load(config.as_deref())?;
            init_tracing(&config.log_level);

            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(url) = redis {
                config.store.backend = StoreBackend::Redis;
                config.store.url = url;
            }
            if memory {
                config.store.backend = StoreBackend::Memory;
            }
            if let Some(path) = seed {
                config.server.seed_file = Some(path);
            }
            if let Some(strategy) = strategy {
                config.topk.strategy = match strategy {
                    Strategy::Script => TopKStrategy::Script,
                    Strategy::Optimistic => TopKStrategy::Optimistic,
                };
            }
            config.validate()?;

            let mut server = Server::new(config);
            if demo {
                server = server.with_catalog(demo_catalog());
            }
            server.serve().await?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
