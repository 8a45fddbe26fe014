use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use propwatch_adapters::{sources_from_registry, SourceRegistry};
use propwatch_monitor::{Monitor, MonitorConfig};
use propwatch_notify::{DiscordSink, Dispatcher};
use propwatch_storage::{HistoryStore, PageFetcher};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "propwatch")]
#[command(about = "Property listing monitor: scrape, diff, notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the monitor loop until interrupted.
    Run,
    /// Run a single cycle and exit.
    Once,
    /// Send a test notification to the configured webhook.
    TestNotify,
    /// Create a history backup and evict stale ones.
    Backup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let shutdown = monitor_shutdown();
            let mut monitor = build_monitor_with_shutdown(&config, shutdown).await?;
            monitor.run().await
        }
        Commands::Once => {
            let (_, rx) = watch::channel(false);
            let mut monitor = build_monitor_with_shutdown(&config, rx).await?;
            let initialized = !monitor.store().is_empty();
            let stats = monitor.run_cycle(initialized).await?;
            println!("{stats}");
            Ok(())
        }
        Commands::TestNotify => {
            let webhook_url = require_webhook(&config)?;
            let sink = DiscordSink::new(webhook_url, config.max_price)?;
            sink.send_test()
                .await
                .map_err(|err| anyhow::anyhow!("test notification failed: {err}"))?;
            println!("test notification delivered");
            Ok(())
        }
        Commands::Backup => {
            let store = HistoryStore::open(config.history_path())
                .await
                .context("opening history store")?;
            let path = store.backup(config.backup_retention).await?;
            println!("backup written to {}", path.display());
            Ok(())
        }
    }
}

fn require_webhook(config: &MonitorConfig) -> Result<String> {
    match &config.webhook_url {
        Some(url) if !url.is_empty() => Ok(url.clone()),
        _ => bail!("PROPWATCH_DISCORD_WEBHOOK_URL is not set"),
    }
}

fn monitor_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down after the current step");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn build_monitor_with_shutdown(
    config: &MonitorConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<Monitor> {
    let registry = SourceRegistry::load(&config.sources_file)
        .with_context(|| format!("loading {}", config.sources_file.display()))?;
    let sources = sources_from_registry(&registry)?;
    if sources.is_empty() {
        bail!("no enabled sources in {}", config.sources_file.display());
    }

    let webhook_url = require_webhook(config)?;
    let sink = Arc::new(DiscordSink::new(webhook_url, config.max_price)?);
    let dispatcher = Dispatcher::new(sink, config.rate_limit_per_minute, config.backoff());

    let store = HistoryStore::open(config.history_path())
        .await
        .context("opening history store")?;
    let fetcher = PageFetcher::new(config.fetch_policy())?;

    info!(
        sources = sources.len(),
        max_price = config.max_price,
        interval_secs = config.scrape_interval.as_secs(),
        "monitor configured"
    );
    Ok(Monitor::new(
        sources, fetcher, dispatcher, store, config.clone(), shutdown,
    ))
}
