//! Task API endpoints

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;

use vg_core::task::{Task, TaskEvent, TaskStatus};
use vg_core::Error;

use super::{api_error, RouteError};
use crate::gateway::protocol::StreamEvent;
use crate::state::GatewayState;
use crate::stream::{forward_to_websocket, sse_stream};

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub goal: String,
    /// Pin the task to one worker instead of letting the gateway pick.
    #[serde(default)]
    pub worker_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub id: Uuid,
    pub worker_id: String,
    pub goal: String,
    pub status: TaskStatus,
    pub channel_id: Option<String>,
    pub conversation_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub event_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: TaskResponse,
    pub events: Vec<TaskEvent>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            worker_id: task.worker_id.clone(),
            goal: task.goal.clone(),
            status: task.status,
            channel_id: task.channel_id.clone(),
            conversation_id: task.conversation_id.clone(),
            result: task.result.clone(),
            error: task.error_message.clone(),
            event_count: task.events.len(),
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        }
    }
}

impl From<Task> for TaskDetailResponse {
    fn from(task: Task) -> Self {
        Self {
            task: TaskResponse::from(&task),
            events: task.events,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/tasks - List all tasks
async fn list_tasks(State(state): State<GatewayState>) -> Json<Vec<TaskResponse>> {
    let tasks = state.broker().list_tasks().await;
    Json(tasks.iter().map(TaskResponse::from).collect())
}

/// POST /api/tasks - Create and dispatch a task
async fn create_task(
    State(state): State<GatewayState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), RouteError> {
    let task_id = state
        .broker()
        .submit(req.goal, req.worker_id.as_deref())
        .await
        .map_err(api_error)?;
    let task = fetch_task(&state, task_id).await?;

    Ok((StatusCode::CREATED, Json(TaskResponse::from(&task))))
}

/// GET /api/tasks/{id} - Task with its event history
async fn get_task(
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskDetailResponse>, RouteError> {
    let task = fetch_task(&state, id).await?;
    Ok(Json(TaskDetailResponse::from(task)))
}

/// POST /api/tasks/{id}/stop - Cancel a task
async fn stop_task(
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, RouteError> {
    let task = state.broker().stop(id).await.map_err(api_error)?;
    Ok(Json(TaskResponse::from(&task)))
}

/// POST /api/tasks/{id}/message - Follow-up instruction for an active task
async fn send_message(
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), RouteError> {
    state
        .broker()
        .send_message(id, req.content)
        .await
        .map_err(api_error)?;
    let task = fetch_task(&state, id).await?;

    Ok((StatusCode::ACCEPTED, Json(TaskResponse::from(&task))))
}

/// GET /api/tasks/{id}/stream - SSE feed of one task's events
async fn stream_task(
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
) -> Result<Response, RouteError> {
    // Subscribe before reading the status, so a task finishing in between
    // is seen either here or by the subscription.
    let live = sse_stream(state.hub(), id.to_string());
    let task = fetch_task(&state, id).await?;

    // Nothing more will be published for a finished task; replay its last
    // event so the client still sees how it ended.
    if task.status.is_terminal() {
        drop(live);
        let last = task
            .events
            .last()
            .map(|event| StreamEvent::from_task_event(task.id, task.status, event));
        let events = stream::iter(last.into_iter().map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok::<_, Infallible>(Event::default().event(event.event_type.as_str()).data(data))
        }));
        return Ok(Sse::new(events).into_response());
    }

    Ok(live.into_response())
}

/// GET /api/tasks/{id}/ws - WebSocket feed of one task's events
async fn task_ws(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
) -> Result<Response, RouteError> {
    fetch_task(&state, id).await?;
    let hub = state.hub().clone();
    Ok(ws
        .on_upgrade(move |socket| forward_to_websocket(socket, hub, id.to_string()))
        .into_response())
}

async fn fetch_task(state: &GatewayState, id: Uuid) -> Result<Task, RouteError> {
    state
        .broker()
        .get_task(id)
        .await
        .ok_or_else(|| api_error(Error::TaskNotFound(id.to_string())))
}

// ============================================================================
// Router
// ============================================================================

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/stop", post(stop_task))
        .route("/api/tasks/{id}/message", post(send_message))
        .route("/api/tasks/{id}/stream", get(stream_task))
        .route("/api/tasks/{id}/ws", get(task_ws))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::protocol::GatewayFrame;
    use crate::gateway::registry::tests::test_worker;
    use crate::routes::test_support::{get as get_request, json_request, send};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    async fn state_with_worker() -> (GatewayState, mpsc::UnboundedReceiver<GatewayFrame>) {
        let state = GatewayState::new(GatewayConfig::default()).unwrap();
        let (worker, rx, _kick) = test_worker("w-1");
        state.connections().register(worker).await;
        (state, rx)
    }

    #[tokio::test]
    async fn create_without_workers_returns_503() {
        let state = GatewayState::new(GatewayConfig::default()).unwrap();
        let app = router().with_state(state.clone());

        let (status, body) = send(
            app,
            json_request("POST", "/api/tasks", json!({"goal": "status?"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
        assert!(state.broker().list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_empty_goal() {
        let (state, _rx) = state_with_worker().await;
        let (status, _) = send(
            router().with_state(state),
            json_request("POST", "/api/tasks", json!({"goal": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_get_stop_flow() {
        let (state, mut rx) = state_with_worker().await;
        let app = router().with_state(state.clone());

        let (status, created) = send(
            app.clone(),
            json_request("POST", "/api/tasks", json!({"goal": "status?"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["workerId"], "w-1");
        let id = created["id"].as_str().unwrap().to_string();
        assert!(matches!(
            rx.try_recv().unwrap(),
            GatewayFrame::TaskSubmit { .. }
        ));

        let (status, detail) = send(app.clone(), get_request(&format!("/api/tasks/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["events"][0]["kind"], "submitted");

        let (status, stopped) = send(
            app.clone(),
            json_request("POST", &format!("/api/tasks/{}/stop", id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped["status"], "stopped");
        assert!(matches!(
            rx.try_recv().unwrap(),
            GatewayFrame::TaskStop { .. }
        ));

        let (status, _) = send(
            app.clone(),
            json_request("POST", &format!("/api/tasks/{}/stop", id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            app,
            json_request(
                "POST",
                &format!("/api/tasks/{}/message", id),
                json!({"content": "more"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn follow_up_message_is_forwarded() {
        let (state, mut rx) = state_with_worker().await;
        let task_id = state
            .broker()
            .submit("deploy".to_string(), None)
            .await
            .unwrap();
        let _submit = rx.try_recv().unwrap();

        let (status, body) = send(
            router().with_state(state),
            json_request(
                "POST",
                &format!("/api/tasks/{}/message", task_id),
                json!({"content": "use the canary"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["eventCount"], 2);
        assert_eq!(
            rx.try_recv().unwrap(),
            GatewayFrame::TaskMessage {
                task_id,
                content: "use the canary".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let state = GatewayState::new(GatewayConfig::default()).unwrap();
        let (status, _) = send(
            router().with_state(state),
            get_request(&format!("/api/tasks/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sse_listener_is_released_when_client_goes_away() {
        let (state, _rx) = state_with_worker().await;
        let task_id = state
            .broker()
            .submit("watch me".to_string(), None)
            .await
            .unwrap();
        let key = task_id.to_string();

        let response = router()
            .with_state(state.clone())
            .oneshot(get_request(&format!("/api/tasks/{}/stream", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.hub().listener_count(&key), 1);

        drop(response);
        assert_eq!(state.hub().listener_count(&key), 0);
        assert_eq!(state.hub().total_listeners(), 0);
    }

    #[tokio::test]
    async fn stream_ends_when_task_finishes() {
        let (state, _rx) = state_with_worker().await;
        let task_id = state
            .broker()
            .submit("watch me".to_string(), None)
            .await
            .unwrap();

        let response = router()
            .with_state(state.clone())
            .oneshot(get_request(&format!("/api/tasks/{}/stream", task_id)))
            .await
            .unwrap();
        state.broker().stop(task_id).await.unwrap();

        let body = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("stream should end after the terminal event")
        .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: done"));
        assert_eq!(state.hub().total_listeners(), 0);
    }

    #[tokio::test]
    async fn unknown_task_stream_leaves_no_listener() {
        let state = GatewayState::new(GatewayConfig::default()).unwrap();
        let (status, _) = send(
            router().with_state(state.clone()),
            get_request(&format!("/api/tasks/{}/stream", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.hub().total_listeners(), 0);
    }

    async fn serve(state: GatewayState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::routes::app(state)).await.unwrap();
        });
        addr
    }

    async fn wait_for_listeners(state: &GatewayState, key: &str, expected: usize) -> bool {
        for _ in 0..100 {
            if state.hub().listener_count(key) == expected {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn ws_listener_is_released_when_client_closes() {
        let (state, _rx) = state_with_worker().await;
        let task_id = state
            .broker()
            .submit("watch me".to_string(), None)
            .await
            .unwrap();
        let key = task_id.to_string();
        let addr = serve(state.clone()).await;

        let (mut client, _) =
            connect_async(format!("ws://{}/api/tasks/{}/ws", addr, task_id))
                .await
                .unwrap();
        assert!(wait_for_listeners(&state, &key, 1).await);

        client.close(None).await.unwrap();
        assert!(wait_for_listeners(&state, &key, 0).await);
    }

    #[tokio::test]
    async fn ws_sends_terminal_event_then_closes() {
        let (state, _rx) = state_with_worker().await;
        let task_id = state
            .broker()
            .submit("watch me".to_string(), None)
            .await
            .unwrap();
        let key = task_id.to_string();
        let addr = serve(state.clone()).await;

        let (mut client, _) =
            connect_async(format!("ws://{}/api/tasks/{}/ws", addr, task_id))
                .await
                .unwrap();
        assert!(wait_for_listeners(&state, &key, 1).await);
        state.broker().stop(task_id).await.unwrap();

        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let WsMessage::Text(text) = frame else {
            panic!("expected a text frame, got {:?}", frame);
        };
        let event: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(event["type"], "done");
        assert_eq!(event["status"], "stopped");

        let closing = tokio::time::timeout(std::time::Duration::from_secs(2), client.next())
            .await
            .unwrap();
        assert!(matches!(closing, Some(Ok(WsMessage::Close(_))) | None));
        assert_eq!(state.hub().total_listeners(), 0);
    }

    #[tokio::test]
    async fn finished_task_stream_replays_final_event() {
        let (state, _rx) = state_with_worker().await;
        let task_id = state
            .broker()
            .submit("quick".to_string(), None)
            .await
            .unwrap();
        state.broker().stop(task_id).await.unwrap();

        let response = router()
            .with_state(state.clone())
            .oneshot(get_request(&format!("/api/tasks/{}/stream", task_id)))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: done"));
        assert_eq!(state.hub().total_listeners(), 0);
    }
}
