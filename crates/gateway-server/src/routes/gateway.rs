//! Worker endpoints: the control-protocol socket and the worker listing

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::gateway::registry::WorkerStatus;
use crate::gateway::worker_ws_handler;
use crate::state::GatewayState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerResponse {
    #[serde(flatten)]
    worker: WorkerStatus,
    active_tasks: Vec<Uuid>,
}

/// GET /api/workers - connected workers, longest-connected first
async fn list_workers(State(state): State<GatewayState>) -> Json<Vec<WorkerResponse>> {
    let mut active = state.broker().active_tasks_by_worker().await;
    let workers = state
        .connections()
        .list()
        .await
        .into_iter()
        .map(|worker| WorkerResponse {
            active_tasks: active.remove(&worker.id).unwrap_or_default(),
            worker,
        })
        .collect();
    Json(workers)
}

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/workers/ws", get(worker_ws_handler))
        .route("/api/workers", get(list_workers))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::registry::tests::test_worker;
    use crate::routes::test_support::{get as get_request, send};

    #[tokio::test]
    async fn lists_workers_with_their_active_tasks() {
        let state = GatewayState::new(GatewayConfig::default()).unwrap();
        let (worker, _rx, _kick) = test_worker("w-1");
        state.connections().register(worker).await;
        let (idle, _idle_rx, _idle_kick) = test_worker("w-2");
        state.connections().register(idle).await;

        let task_id = state
            .broker()
            .submit("tail the logs".to_string(), Some("w-1"))
            .await
            .unwrap();

        let (status, body) = send(router().with_state(state), get_request("/api/workers")).await;
        assert_eq!(status, StatusCode::OK);
        let workers = body.as_array().unwrap();
        assert_eq!(workers.len(), 2);

        let busy = workers.iter().find(|w| w["id"] == "w-1").unwrap();
        assert_eq!(busy["activeTasks"], serde_json::json!([task_id.to_string()]));
        let idle = workers.iter().find(|w| w["id"] == "w-2").unwrap();
        assert_eq!(idle["activeTasks"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn socket_route_requires_upgrade() {
        let state = GatewayState::new(GatewayConfig::default()).unwrap();
        let (status, _) = send(router().with_state(state), get_request("/workers/ws")).await;
        assert!(status.is_client_error());
    }
}
