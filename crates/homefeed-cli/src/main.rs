use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use homefeed_adapters::{FeedSource, FixtureFeedSource};
use homefeed_storage::{ListingStore, PgListingStore};
use homefeed_sync::{map_feed_source, SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "homefeed-cli")]
#[command(about = "Listing sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the map feed once and reconcile it into the database.
    Sync {
        /// Read the feed from a captured response file instead of the network.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    Migrate,
    Serve,
    /// Print the most recent sync runs.
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { fixture: None }) {
        Commands::Sync { fixture } => {
            let store = Arc::new(connect(&config).await?);
            let source: Box<dyn FeedSource> = match fixture {
                Some(path) => Box::new(FixtureFeedSource::new(path)),
                None => map_feed_source(&config)?,
            };
            let outcome = SyncPipeline::configured(&config, source, store)
                .run_once()
                .await?;
            println!("sync complete: success={} count={}", outcome.success, outcome.count);
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => homefeed_web::serve_from_env().await?,
        Commands::Logs { limit } => {
            let store = connect(&config).await?;
            for log in store.recent_sync_logs(limit).await? {
                println!(
                    "{} {} items={} {}",
                    log.created_at.to_rfc3339(),
                    log.status,
                    log.items_count.map_or_else(|| "-".to_string(), |n| n.to_string()),
                    log.message.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgListingStore> {
    PgListingStore::connect(&config.database_url, config.database_max_connections).await
}
