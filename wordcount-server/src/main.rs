mod bigquery;
mod config;
mod credentials;
mod error;
mod query;
mod render;
mod routes;
mod state;

use config::Config;
use state::AppState;
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    // RUST_LOG wins; development mode only changes the fallback level.
    let default_level = if cfg.dev_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Configured to search for word: '{}'", cfg.word);
    debug!("Configuration: {:?}", cfg);

    let addr: SocketAddr = cfg.listen_addr().parse()?;
    let state = Arc::new(AppState::initialize(cfg).await);
    let app = routes::router(state);

    info!(%addr, "Starting wordcount-server");
    let server = axum::Server::bind(&addr).serve(app.into_make_service());

    let graceful = server.with_graceful_shutdown(shutdown_signal());
    graceful.await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("Shutdown signal received");
}
