//! Viber gateway server
//!
//! Accepts messages from chat platforms and a browser channel, dispatches
//! them as tasks to connected agent workers over WebSocket and streams the
//! results back. One HTTP/WS listener serves everything.

mod broker;
mod channels;
mod config;
mod gateway;
mod routes;
mod state;
mod stream;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::GatewayConfig;
use crate::gateway::start_heartbeat_checker;
use crate::state::GatewayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gateway_server=debug,vg_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env();
    let bind = config.bind;
    let state = GatewayState::new(config).context("Failed to initialize gateway state")?;
    tracing::info!("Channels enabled: {}", state.channels().ids().join(", "));

    let heartbeat = start_heartbeat_checker(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!("Gateway listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    heartbeat.abort();
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
