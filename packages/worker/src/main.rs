// Main entry point for the background job worker

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_core::config::Config;
use worker_core::health::{self, WorkerState};
use worker_core::jobs::processors::{self, PortalClient};
use worker_core::jobs::{Dispatcher, DispatcherConfig, LeaseManager};
use worker_core::retry::RetryConfig;
use worker_core::db;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting compliance job worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = db::pool(&config).await?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let state = Arc::new(WorkerState::new());

    // Health surface
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind health endpoint")?;
    tracing::info!("Health check: http://localhost:{}/health", config.port);
    let health_app = health::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_app).await {
            tracing::error!(error = %e, "health server error");
        }
    });

    spawn_signal_handler(state.clone());

    // Build the dispatcher
    let retry = RetryConfig::from_app_config(&config);
    let portal = Arc::new(PortalClient::new(&config)?);
    let registry = processors::registry(portal, retry);
    let lease = LeaseManager::new(pool.clone(), config.lock_timeout());
    let dispatcher = Dispatcher::new(
        pool,
        lease,
        registry,
        DispatcherConfig::from_app_config(&config),
        state,
    );

    dispatcher.run().await?;

    db::close().await;
    Ok(())
}

/// Flip the shutdown flag on SIGINT or SIGTERM.
fn spawn_signal_handler(state: Arc<WorkerState>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("received shutdown signal");
        state.request_shutdown();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
