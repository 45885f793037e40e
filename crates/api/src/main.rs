// API server clippy configuration
#![allow(clippy::result_large_err)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! PricEye Billing API Server
//!
//! Serves checkout and pricing to the dashboard and receives Stripe webhooks.

use std::net::SocketAddr;

use priceye_api::routes::cors_layer;
use priceye_api::{create_router, AppState, Config};
use priceye_billing::BillingService;
use priceye_shared::{create_migration_pool, create_pool};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,priceye_api=debug,priceye_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PricEye Billing API v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations go through the direct URL; poolers reject prepared statements
    if config.run_migrations {
        let migration_url = config
            .database_direct_url
            .as_ref()
            .unwrap_or(&config.database_url);
        let migration_pool = create_migration_pool(migration_url).await?;
        priceye_shared::run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let billing = BillingService::from_env(pool)?;
    tracing::info!("Stripe billing configured");

    let state = AppState::new(config.clone(), billing);

    let app = create_router(state.clone())
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let webhook syncs that were already acknowledged finish
    let aborted = state.tasks.drain(config.task_drain_timeout).await;
    tracing::info!(aborted = aborted, "Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
