use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealerscope_core::Source;
use dealerscope_storage::{DealerStore, PgDealerStore};
use dealerscope_sync::{Scheduler, SourceRegistry, SyncConfig, SyncContext};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dealerscope")]
#[command(about = "Dealer-locator ingestion and query service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one source now.
    Sync {
        #[arg(long)]
        source: Source,
        /// Keep results in memory instead of Postgres.
        #[arg(long)]
        memory: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run every enabled source on its interval until Ctrl-C.
    Schedule {
        #[arg(long)]
        memory: bool,
    },
    /// Start the query API.
    Serve,
    /// Create tables and indexes.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            source,
            memory,
            json,
        } => {
            let summary = dealerscope_sync::run_source_once_from_env(source, memory).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let apply = summary.apply.unwrap_or_default();
                println!(
                    "sync complete: run_id={} source={} terms={} failed_terms={} raw={} upserted={} retired={} skipped_apply={}",
                    summary.run_id,
                    summary.source,
                    summary.terms_total,
                    summary.terms_failed.len(),
                    summary.raw_tuples,
                    apply.upserted,
                    apply.retired,
                    summary.apply.is_none()
                );
            }
        }
        Commands::Schedule { memory } => {
            let config = SyncConfig::from_env();
            let registry = SourceRegistry::load(&config.sources_path).await?;
            let context = if memory {
                SyncContext::in_memory(&config)?
            } else {
                SyncContext::connect(&config).await?
            };
            let scheduler = Arc::new(Scheduler::from_registry(&registry, &context));
            let sources = scheduler.sources();
            let mut jobs = scheduler.start().await?;
            info!(?sources, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            jobs.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            dealerscope_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgDealerStore::connect(&config.database_url).await?;
            store.ensure_schema().await?;
            println!("schema ready");
        }
    }

    Ok(())
}
