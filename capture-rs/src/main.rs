use anyhow::Context;
use capture_rs::alias::AliasSnapshot;
use capture_rs::config::{Config, StorageBackend};
use capture_rs::metrics::Metrics;
use capture_rs::retention::RetentionScanner;
use capture_rs::smtp::{ServerContext, SmtpServer};
use capture_rs::storage::{DataStore, FileStore, MemoryStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "capture-rs")]
#[command(about = "Disposable-mailbox SMTP capture server", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::development(),
    };

    init_logging(&config);
    info!("Starting capture-rs v{}", env!("CARGO_PKG_VERSION"));
    if cli.config.is_none() {
        info!("No config file specified, using development defaults");
    }

    info!("Configuration loaded");
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  Storage: {:?} at {}", config.storage.backend, config.storage.path);
    info!("  Domain: {}", config.smtp.domain);
    info!("  No-store domain: {}", config.smtp.domain_no_store);

    let store: Arc<dyn DataStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => {
            let store = FileStore::open(&config.storage.path)
                .await
                .context("Failed to open mail store")?;
            store
                .recover()
                .await
                .context("Failed to clean unsealed messages")?;
            Arc::new(store)
        }
    };

    let aliases = AliasSnapshot::load(&config.aliases)
        .await
        .context("Failed to load aliases")?;
    let metrics = Arc::new(Metrics::new());

    let retention = RetentionScanner::new(
        store.clone(),
        config.storage.retention_window(),
        config.storage.retention_sleep(),
        metrics.clone(),
    )
    .start();

    let listener = TcpListener::bind(&config.smtp.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.smtp.listen_addr))?;

    let server = Arc::new(SmtpServer::new(ServerContext::new(
        config,
        store,
        Arc::new(aliases),
        metrics.clone(),
    )));

    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, no longer accepting connections");
    server.shutdown();

    match accept.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("SMTP server error: {}", e),
        Err(e) => error!("SMTP task panic: {}", e),
    }

    info!("Waiting for {} open sessions to finish", server.live_sessions());
    server.drain().await;

    if let Some(handle) = retention {
        handle.abort();
    }
    info!("Final metrics:\n{}", metrics.to_prometheus());
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("capture_rs={}", config.logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}
