use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::api::{self, AppState};
use super::db::{DbHandle, PlatformDb};
use super::jobs::{DispatchSettings, ImportDispatcher, spawn_autoimport_scheduler};
use crate::importers::{HttpFetcher, Importer, SourceSettings};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Configuration for the HTTP service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub cors_permissive: bool,
    pub dispatch: DispatchSettings,
    pub autoimport_interval: Duration,
    pub request_timeout: Duration,
    pub sources: SourceSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            db_path: PathBuf::from(".crowdtask/crowdtask.db"),
            cors_permissive: false,
            dispatch: DispatchSettings::default(),
            autoimport_interval: Duration::from_secs(86_400),
            request_timeout: Duration::from_secs(30),
            sources: SourceSettings::default(),
        }
    }
}

/// Build the full application router with request tracing.
pub fn build_router(state: Arc<AppState>, cors_permissive: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the service: open the store, start the import workers and the
/// autoimport scheduler, recover jobs from a previous run, then serve until
/// Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = PlatformDb::new(&config.db_path).with_context(|| {
        format!(
            "Failed to initialize database at {}",
            config.db_path.display()
        )
    })?;
    let db = DbHandle::new(db);
    let (events, _rx) = broadcast::channel::<String>(EVENT_CAPACITY);

    let fetcher = Arc::new(HttpFetcher::new(config.request_timeout)?);
    let importer = Arc::new(Importer::new(fetcher, config.sources.clone()));
    info!(importers = ?importer.get_all_importer_names(), "Registered importers");

    let dispatcher = ImportDispatcher::new(importer, db.clone(), events.clone(), config.dispatch);
    let workers = dispatcher.spawn_workers();
    dispatcher
        .recover_jobs()
        .await
        .context("Failed to recover import jobs")?;
    let scheduler = spawn_autoimport_scheduler(dispatcher.clone(), config.autoimport_interval);

    let state = Arc::new(AppState {
        db,
        events,
        dispatcher,
    });
    let app = build_router(state, config.cors_permissive);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr: SocketAddr = listener.local_addr()?;
    info!(
        %local_addr,
        workers = workers.len(),
        max_synchronous_tasks = config.dispatch.max_synchronous_tasks,
        "crowdtask listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    scheduler.abort();
    workers.abort();
    info!("Server shut down");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C, shutting down");
        return;
    }
    info!("Shutting down");
}
