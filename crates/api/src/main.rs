//! Keepwarden API Server
//!
//! Receives Stripe webhooks and exposes the admin reconciliation and claim
//! endpoints.

use std::net::SocketAddr;

use keepwarden_access::Services;
use keepwarden_api::{create_router, AppState};
use keepwarden_shared::{create_pool, run_migrations, Config};
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
                .unwrap_or_else(|_| "info,keepwarden_api=debug,keepwarden_access=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keepwarden API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;

    let services = Services::from_config(&config, pool);
    let state = AppState::new(services.clone(), &config);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    // Let queued role changes from recent webhooks finish
    services.queue.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}
