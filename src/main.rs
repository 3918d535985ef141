//! pingfleet - ICMP reachability monitoring for endpoint fleets
//!
//! Probes endpoints in rounds, keeps live per-endpoint statistics, rolls raw
//! results up into minute and hour buckets and serves both over HTTP.

mod config;
mod db;
mod events;
mod probe;
mod scheduler;
mod stats;
mod web;

use config::{ProbeSettings, ServerConfig};
use db::Store;
use events::BroadcastPublisher;
use probe::IcmpTransport;
use scheduler::{ProbeEngine, RetentionManager, RollupManager, Scope, StoreResolver};
use stats::StatsAggregator;
use web::Server;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingfleet=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting pingfleet on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let settings = load_settings(&store);

    // Add sample endpoint if none exist
    if store.list_endpoints()?.is_empty() {
        tracing::info!("Adding sample endpoint: localhost");
        store.add_endpoint("localhost", "127.0.0.1", None)?;
    }

    // Background maintenance
    let background = CancellationToken::new();
    let rollups = RollupManager::new(store.clone()).start(background.clone());
    let retention = RetentionManager::new(store.clone()).start(background.clone());

    // Probe engine
    let publisher = BroadcastPublisher::new();
    let engine = Arc::new(ProbeEngine::new(
        Arc::new(StoreResolver::new(store.clone())),
        Arc::new(IcmpTransport::new()),
        StatsAggregator::new(store.clone()),
        Arc::new(publisher.clone()),
        settings,
        cfg.probe_workers,
    ));
    engine.start(Scope::All, Vec::new()).await?;

    // Start web server
    let server = Server::new(cfg, store, engine.clone(), publisher.clone());
    let served = server
        .start(async move {
            shutdown_signal().await;
            // Ends open event streams so the server can drain
            publisher.close();
        })
        .await;

    tracing::info!("Shutting down...");
    engine.stop().await;
    background.cancel();
    let _ = tokio::join!(rollups, retention);

    served
}

/// Persisted settings, or defaults when none are saved or they fail to load.
fn load_settings(store: &Store) -> ProbeSettings {
    match store.load_settings() {
        Ok(Some(settings)) => match settings.validate() {
            Ok(()) => settings,
            Err(e) => {
                tracing::warn!("Ignoring persisted probe settings: {}", e);
                ProbeSettings::default()
            }
        },
        Ok(None) => ProbeSettings::default(),
        Err(e) => {
            tracing::warn!("Failed to load probe settings, using defaults: {}", e);
            ProbeSettings::default()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
