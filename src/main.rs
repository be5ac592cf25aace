//! Uptrail - HTTP(S) uptime monitoring with layered diagnosis.
//!
//! Each monitor is probed on its own cadence through DNS, TCP, TLS and HTTP.
//! Results are classified, debounced into confirmed UP/DOWN transitions and
//! tracked as incidents; certificate expiry is watched alongside.

mod analysis;
mod cli;
mod config;
mod db;
mod monitor;
mod notify;
mod probe;
mod queue;
mod scheduler;
mod tls_expiry;

use clap::Parser;
use cli::{Args, Command};
use config::ServerConfig;
use db::Store;
use notify::{LogNotifier, Notifier, WebhookNotifier};
use queue::{JobQueue, MemoryQueue};
use scheduler::Scheduler;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Uptrail...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    match args.command.unwrap_or(Command::Run) {
        Command::Run => serve(store, &cfg).await,
        command => {
            print!("{}", cli::run_admin(command, store, &cfg).await?);
            Ok(())
        }
    }
}

async fn serve(
    store: Arc<Store>,
    cfg: &ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let notifier = build_notifier(cfg)?;
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new());
    let scheduler = Arc::new(Scheduler::new(store.clone(), queue.clone(), notifier, cfg));

    // Add the seed monitor if none exist
    if let Some(url) = &cfg.seed_url {
        if store.get_monitors()?.is_empty() {
            tracing::info!("Adding seed monitor: {}", url);
            scheduler.create_monitor(&cfg.seed_owner, url, 60).await?;
        }
    }

    // Start scheduler; reconciles every persisted monitor first
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop().await;
    queue.close().await;

    Ok(())
}

fn build_notifier(cfg: &ServerConfig) -> Result<Arc<dyn Notifier>, notify::NotifyError> {
    match &cfg.webhook_url {
        Some(url) => {
            tracing::info!("Delivering alerts to webhook {}", url);
            let timeout = Duration::from_secs(cfg.http_timeout_secs.max(1));
            Ok(Arc::new(WebhookNotifier::new(url.clone(), timeout)?))
        }
        None => {
            tracing::info!("No webhook configured, alerts are logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_selection() {
        let cfg = ServerConfig::default();
        assert!(build_notifier(&cfg).is_ok());

        let cfg = ServerConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".to_string()),
            ..Default::default()
        };
        assert!(build_notifier(&cfg).is_ok());
    }

    #[test]
    fn test_startup_on_empty_store() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let queue = Arc::new(MemoryQueue::new());
        let cfg = ServerConfig::default();
        let scheduler = Scheduler::new(store, queue.clone(), Arc::new(LogNotifier), &cfg);

        let reconciled = tokio_test::block_on(scheduler.reconcile()).unwrap();
        assert_eq!(reconciled, 0);
        assert!(tokio_test::block_on(queue.pending()).unwrap().is_empty());
    }
}
