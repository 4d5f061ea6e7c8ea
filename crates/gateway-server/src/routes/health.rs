//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ConfigSnapshot;
use crate::state::GatewayState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    started_at: DateTime<Utc>,
    workers: usize,
    active_tasks: usize,
    /// Live SSE/WebSocket stream listeners.
    subscribers: usize,
    channels: Vec<&'static str>,
    config: ConfigSnapshot,
}

async fn health_check(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at(),
        workers: state.connections().count().await,
        active_tasks: state.broker().active_count().await,
        subscribers: state.hub().total_listeners(),
        channels: state.channels().ids(),
        config: state.config().snapshot(),
    })
}

pub fn router() -> Router<GatewayState> {
    Router::new().route("/health", get(health_check))
}
