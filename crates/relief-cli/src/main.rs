use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relief_adapters::{parse_feed, FieldExtractor};
use relief_storage::{FeedSource, FileFeed, PgStore};
use relief_sync::{
    build_scheduler, open_store, shutdown_signal, IngestConfig, IngestPipeline, IngestService,
    RunGuard, TriggerSource,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relief-cli")]
#[command(about = "Relief feed ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and exit.
    Sync {
        /// Ingest a local CSV file instead of the configured feed URL.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Start the timer, crawl once on startup, and serve the trigger surface.
    Serve,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Fetch the feed and print extracted candidates without writing anything.
    Preview {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

fn feed_for(config: &IngestConfig, file: Option<PathBuf>) -> Result<Arc<dyn FeedSource>> {
    Ok(match file {
        Some(path) => Arc::new(FileFeed::new(path)),
        None => Arc::new(config.http_fetcher()?),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { file: None }) {
        Commands::Sync { file } => {
            let store = open_store(&config).await?;
            let pipeline = IngestPipeline::from_config(&config, feed_for(&config, file)?, store)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} seen={} added={} duplicate={} empty={} failed={} hash={}",
                summary.run_id,
                summary.rows_seen,
                summary.rows_added,
                summary.rows_duplicate,
                summary.rows_skipped_empty,
                summary.rows_failed,
                summary.content_hash
            );
        }
        Commands::Serve => serve(config).await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Preview { limit, file } => {
            let snapshot = feed_for(&config, file)?.fetch().await?;
            let extractor = FieldExtractor::new(config.field_aliases()?);
            println!("source={} hash={}", snapshot.source, snapshot.content_hash());

            let rows = parse_feed(snapshot.body)?;
            println!("headers: {}", rows.headers().join(" | "));
            let mut shown = 0;
            for row in rows {
                if shown >= limit {
                    break;
                }
                let row = row?;
                match extractor.extract(&row) {
                    Ok(candidate) => {
                        shown += 1;
                        println!(
                            "line {}: name={:?} phone={:?} address={:?} area={:?}",
                            candidate.line,
                            candidate.name,
                            candidate.phone,
                            candidate.location_address(),
                            candidate.area
                        );
                    }
                    Err(warning) => println!("{warning}"),
                }
            }
        }
    }

    Ok(())
}

async fn serve(config: IngestConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let pipeline = IngestPipeline::from_config(&config, feed_for(&config, None)?, store)?;
    let service = Arc::new(IngestService::new(pipeline, RunGuard::new(config.cooldown)));

    let mut scheduler = if config.scheduler_enabled {
        let sched = build_scheduler(Arc::clone(&service), &config.sync_cron).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "ingest timer started");
        Some(sched)
    } else {
        warn!("scheduler disabled; runs only on demand");
        None
    };

    let startup = Arc::clone(&service);
    tokio::spawn(async move {
        startup.trigger(TriggerSource::Startup).await;
    });

    relief_web::serve(service, relief_web::port_from_env(), shutdown_signal()).await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
