//! Channel endpoints: platform webhooks and the browser channel

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{api_error, RouteError};
use crate::broker::RouteOutcome;
use crate::channels::InboundRequest;
use crate::gateway::protocol::{StreamEvent, StreamEventType};
use crate::state::GatewayState;
use crate::stream::sse_stream;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    ok: bool,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<Uuid>,
}

impl From<RouteOutcome> for WebhookResponse {
    fn from(outcome: RouteOutcome) -> Self {
        let label = match outcome {
            RouteOutcome::Created(_) => "created",
            RouteOutcome::Appended(_) => "appended",
            RouteOutcome::Duplicate => "duplicate",
            RouteOutcome::Ignored => "ignored",
        };
        Self {
            ok: true,
            outcome: label,
            task_id: outcome.task_id(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebMessageResponse {
    conversation_id: String,
}

/// POST /channels/{platform}/webhook - signed inbound message or event
async fn receive_webhook(
    State(state): State<GatewayState>,
    Path(platform): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, RouteError> {
    let request = InboundRequest::new(&headers, query, body);
    let outcome = state
        .channels()
        .handle_webhook(&platform, request)
        .await
        .map_err(api_error)?;
    Ok(Json(WebhookResponse::from(outcome)))
}

/// GET /channels/{platform}/webhook - URL-ownership challenge
async fn verify_webhook_url(
    State(state): State<GatewayState>,
    Path(platform): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<String, RouteError> {
    let request = InboundRequest::new(&headers, query, String::new());
    let echo = state
        .channels()
        .verify_url(&platform, request)
        .await
        .map_err(api_error)?;
    info!("{} URL verification succeeded", platform);
    Ok(echo)
}

/// POST /channels/web/message - browser message, routed in the background
async fn post_web_message(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, RouteError> {
    let request = InboundRequest::new(&headers, HashMap::new(), body);
    let Some(message) = state
        .channels()
        .accept("web", request)
        .await
        .map_err(|err| match err {
            // The browser channel is unsigned; a rejection means bad input.
            vg_core::Error::Verification(inner) => {
                super::error_response(StatusCode::BAD_REQUEST, inner.to_string())
            }
            other => api_error(other),
        })?
    else {
        return Err(super::error_response(
            StatusCode::BAD_REQUEST,
            "nothing to route",
        ));
    };

    let conversation_id = message.conversation_id.clone();
    let routing_state = state.clone();
    tokio::spawn(async move {
        let conversation_id = message.conversation_id.clone();
        if let Err(err) = routing_state.channels().route_message(message).await {
            warn!("Failed to route web message in {}: {}", conversation_id, err);
            let event = StreamEvent::conversation(StreamEventType::Error, err.to_string());
            routing_state.hub().publish(&conversation_id, &event);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(WebMessageResponse { conversation_id }),
    )
        .into_response())
}

/// GET /channels/web/stream/{conversation_id} - SSE feed of a conversation
async fn web_stream(
    State(state): State<GatewayState>,
    Path(conversation_id): Path<String>,
) -> impl IntoResponse {
    sse_stream(state.hub(), conversation_id)
}

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/channels/web/message", post(post_web_message))
        .route("/channels/web/stream/{conversation_id}", get(web_stream))
        .route(
            "/channels/{platform}/webhook",
            get(verify_webhook_url).post(receive_webhook),
        )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use vg_core::task::{TaskStatus, TaskUpdate};

    use super::*;
    use crate::channels::dingtalk::{DingTalkAdapter, DingTalkConfig};
    use crate::channels::wecom::WeComConfig;
    use crate::config::GatewayConfig;
    use crate::gateway::protocol::GatewayFrame;
    use crate::gateway::registry::tests::test_worker;
    use crate::routes::test_support::{get as get_request, json_request, send};
    use crate::routes::{app, task};

    const DINGTALK_SECRET: &str = "SEC-e2e-secret";
    const WECOM_KEY: &str = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C";

    fn dingtalk_config() -> DingTalkConfig {
        DingTalkConfig {
            app_secret: DINGTALK_SECRET.to_string(),
            timestamp_ttl: Duration::from_secs(300),
        }
    }

    fn wecom_config() -> WeComConfig {
        WeComConfig {
            token: "callback-token".to_string(),
            encoding_aes_key: WECOM_KEY.to_string(),
            corp_id: "ww-e2e".to_string(),
            corp_secret: None,
            agent_id: None,
            api_base: "http://127.0.0.1:9".to_string(),
            timestamp_ttl: Duration::from_secs(300),
        }
    }

    async fn gateway() -> (GatewayState, mpsc::UnboundedReceiver<GatewayFrame>) {
        let state = GatewayState::new(GatewayConfig {
            dingtalk: Some(dingtalk_config()),
            wecom: Some(wecom_config()),
            ..GatewayConfig::default()
        })
        .unwrap();
        let (worker, rx, _kick) = test_worker("w-1");
        state.connections().register(worker).await;
        (state, rx)
    }

    fn dingtalk_webhook(msg_id: &str, text: &str, sign_override: Option<&str>) -> Request<Body> {
        let timestamp = Utc::now().timestamp_millis();
        let signer = DingTalkAdapter::new(dingtalk_config(), reqwest::Client::new());
        let sign = sign_override
            .map(str::to_string)
            .unwrap_or_else(|| signer.sign(timestamp));
        let body = json!({
            "msgId": msg_id,
            "msgtype": "text",
            "conversationId": "cid-ops",
            "senderStaffId": "staff-1",
            "text": { "content": text },
        });
        Request::builder()
            .method("POST")
            .uri("/channels/dingtalk/webhook")
            .header("content-type", "application/json")
            .header("timestamp", timestamp.to_string())
            .header("sign", sign)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn task_status(state: &GatewayState, id: &str) -> Value {
        let (status, body) = send(
            task::router().with_state(state.clone()),
            get_request(&format!("/api/tasks/{}", id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    #[tokio::test]
    async fn signed_webhook_runs_to_completion() {
        let (state, mut rx) = gateway().await;
        let app = app(state.clone());

        let (status, body) = send(app, dingtalk_webhook("m-1", "status?", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "created");
        let id = body["taskId"].as_str().unwrap().to_string();
        let task_id = Uuid::parse_str(&id).unwrap();

        assert_eq!(task_status(&state, &id).await["status"], "pending");
        match rx.try_recv().unwrap() {
            GatewayFrame::TaskSubmit { goal, conversation_id, .. } => {
                assert_eq!(goal, "status?");
                assert_eq!(conversation_id.as_deref(), Some("cid-ops"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        state
            .broker()
            .on_worker_event("w-1", task_id, TaskUpdate::Started)
            .await
            .unwrap();
        assert_eq!(task_status(&state, &id).await["status"], "running");

        state
            .broker()
            .on_worker_event(
                "w-1",
                task_id,
                TaskUpdate::Completed {
                    result: "all green".to_string(),
                },
            )
            .await
            .unwrap();
        let done = task_status(&state, &id).await;
        assert_eq!(done["status"], "completed");
        assert_eq!(done["result"], "all green");
    }

    #[tokio::test]
    async fn bad_signature_is_403_and_creates_nothing() {
        let (state, _rx) = gateway().await;
        let (status, body) = send(
            app(state.clone()),
            dingtalk_webhook("m-1", "status?", Some("Zm9yZ2Vk")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "verification failed");
        assert!(state.broker().list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn replayed_webhook_creates_one_task() {
        let (state, _rx) = gateway().await;

        let (_, first) = send(app(state.clone()), dingtalk_webhook("m-7", "deploy", None)).await;
        let (status, replay) =
            send(app(state.clone()), dingtalk_webhook("m-7", "deploy", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["outcome"], "created");
        assert_eq!(replay["outcome"], "duplicate");

        let tasks = state.broker().list_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].events.len(), 1);
    }

    #[tokio::test]
    async fn wecom_url_challenge_echoes_plaintext_without_task() {
        let (state, _rx) = gateway().await;
        let crypto = crate::channels::wecom_crypto::WeComCrypto::new(
            "callback-token",
            WECOM_KEY,
            "ww-e2e",
        )
        .unwrap();
        let echostr = crypto.encrypt("echo-5150").unwrap();
        let timestamp = Utc::now().timestamp().to_string();
        let signature = crypto.signature(&timestamp, "n0nce", &echostr);

        let uri = format!(
            "/channels/wecom/webhook?msg_signature={}&timestamp={}&nonce=n0nce&echostr={}",
            signature,
            timestamp,
            urlencoding::encode(&echostr)
        );
        let response = tower::ServiceExt::oneshot(app(state.clone()), get_request(&uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"echo-5150");
        assert!(state.broker().list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_platform_is_404() {
        let (state, _rx) = gateway().await;
        let (status, _) = send(
            app(state),
            json_request("POST", "/channels/telegram/webhook", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn web_message_is_accepted_then_routed() {
        let (state, _rx) = gateway().await;
        let (status, body) = send(
            app(state.clone()),
            json_request(
                "POST",
                "/channels/web/message",
                json!({"conversationId": "browser-1", "text": "hello"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["conversationId"], "browser-1");

        for _ in 0..50 {
            if state.broker().active_task_for("browser-1").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.broker().active_task_for("browser-1").await.is_some());
    }

    #[tokio::test]
    async fn web_message_requires_text() {
        let (state, _rx) = gateway().await;
        let (status, _) = send(
            app(state),
            json_request("POST", "/channels/web/message", json!({"text": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn conversation_stream_detaches_on_drop() {
        let (state, _rx) = gateway().await;
        let response = tower::ServiceExt::oneshot(
            app(state.clone()),
            get_request("/channels/web/stream/browser-9"),
        )
        .await
        .unwrap();
        assert_eq!(state.hub().listener_count("browser-9"), 1);
        drop(response);
        assert_eq!(state.hub().listener_count("browser-9"), 0);
    }
}
