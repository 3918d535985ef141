//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::events::BroadcastPublisher;
use crate::scheduler::ProbeEngine;
use crate::stats::StatsService;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub engine: Arc<ProbeEngine>,
    pub stats: StatsService,
    pub publisher: BroadcastPublisher,
}

/// Control-plane HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        engine: Arc<ProbeEngine>,
        publisher: BroadcastPublisher,
    ) -> Self {
        Self {
            state: AppState {
                config,
                stats: StatsService::new(store.clone()),
                store,
                engine,
                publisher,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            // Probe engine
            .route("/api/probe/start", post(handlers::handle_probe_start))
            .route("/api/probe/stop", post(handlers::handle_probe_stop))
            .route("/api/probe/status", get(handlers::handle_probe_status))
            .route(
                "/api/settings",
                get(handlers::handle_get_settings).put(handlers::handle_put_settings),
            )
            // Statistics
            .route("/api/stats/live", get(handlers::handle_live_stats))
            .route("/api/stats/range", get(handlers::handle_range_stats))
            // Inventory
            .route(
                "/api/endpoints",
                get(handlers::handle_get_endpoints).post(handlers::handle_create_endpoint),
            )
            .route("/api/groups", post(handlers::handle_create_group))
            // Storage
            .route("/api/retention", get(handlers::handle_retention))
            .route("/api/storage", get(handlers::handle_storage))
            // Live events
            .route("/api/events", get(handlers::handle_events))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
