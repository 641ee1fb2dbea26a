//! # vertexlb: a load-balancing proxy for Google Vertex AI
//!
//! `vertexlb` exposes an OpenAI-compatible chat-completions endpoint and
//! dispatches each request to one of a pool of Vertex AI targets, where a
//! target binds a (project, region, service-account credential). Its job is the
//! dispatch pipeline: picking a target per request, isolating failures,
//! enforcing daily quotas, surviving upstream rate limits, and translating
//! between the OpenAI wire protocol and Vertex's generative-content
//! protocol, streaming included.
//!
//! ## Request Flow
//!
//! A `POST /v1/chat/completions` request is validated (master credential,
//! JSON shape, `model` field) and handed to the dispatch loop in
//! [`api::handlers::chat_completions`]. The loop acquires a target from the
//! [`balancer::TargetManager`] (which applies daily resets, rotation, and
//! the new-first/LRU tie-break under a single lock), builds a
//! [`vertex::VertexClient`] from the target's service-account key, translates
//! the request via [`translate`], and calls upstream. Failures are classified
//! by the [`errors`] taxonomy; rate limits put the target on cooldown,
//! other failures count toward deactivation, and retryable classifications
//! re-enter the loop on a fresh target. Every attempt is recorded through the
//! append-only request log.
//!
//! Streaming responses are translated chunk-by-chunk into OpenAI SSE frames
//! and always terminate with `data: [DONE]`; failover stops at the first
//! upstream byte.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); persistence
//! is SQLx over SQLite with the repository pattern ([`db`]). Targets are
//! administered externally (and seeded from [`config`]); this crate mutates
//! only their counters.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use vertexlb::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = vertexlb::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     vertexlb::telemetry::init_telemetry();
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod balancer;
pub mod config;
pub mod db;
pub mod errors;
pub mod openai;
pub mod telemetry;
pub mod translate;
mod types;
pub mod vertex;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, instrument};

use crate::balancer::TargetManager;
pub use crate::config::Config;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Config,
    pub manager: Arc<TargetManager>,
    pub http: reqwest::Client,
}

/// Get the vertexlb database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Open the connection pool and run migrations.
pub async fn setup_database(config: &Config) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    migrator().run(&pool).await?;
    Ok(pool)
}

/// Upsert the targets listed in the configuration file. Runs on every
/// startup; existing bindings get their credential refreshed and failure
/// state cleared, exactly like an admin re-adding them.
#[instrument(skip_all)]
pub async fn seed_targets(manager: &TargetManager, config: &Config) -> anyhow::Result<()> {
    for spec in &config.targets {
        let target = manager.add_or_reactivate(spec).await?;
        debug!(project_id = %target.project_id, location = %target.location, "Seeded target from configuration");
    }
    Ok(())
}

/// Build the application router: the two proxy endpoints plus tracing and a
/// permissive CORS layer.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(api::handlers::chat_completions::chat_completions))
        .route("/v1/models", get(api::handlers::models::list_models))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] opens the database, runs migrations,
///    seeds configured targets, and builds the router.
/// 2. **Serve**: [`Application::serve`] binds the TCP port and handles
///    requests until the shutdown future resolves.
pub struct Application {
    router: Router,
    config: Config,
    pool: SqlitePool,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting vertexlb with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;
        let manager = Arc::new(TargetManager::new(pool.clone()));
        seed_targets(&manager, &config).await?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let state = AppState {
            db: pool.clone(),
            config: config.clone(),
            manager,
            http,
        };
        let router = build_router(state);

        Ok(Self { router, config, pool })
    }

    /// Start serving until `shutdown` resolves, then close the pool.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("vertexlb listening on http://{bind_addr}");

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        info!("Closing database connections...");
        self.pool.close().await;
        Ok(())
    }
}
