//! Route handlers

pub mod channels;
pub mod gateway;
pub mod health;
pub mod task;

use std::any::Any;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use vg_core::Error;

use crate::state::GatewayState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type RouteError = (StatusCode, Json<ErrorResponse>);

pub fn error_response(status: StatusCode, message: impl Into<String>) -> RouteError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map a gateway error onto a status code and a body that leaks nothing
/// internal.
pub fn api_error(err: Error) -> RouteError {
    match err {
        Error::Verification(_) => error_response(StatusCode::FORBIDDEN, "verification failed"),
        Error::ChannelNotFound(platform) => {
            error_response(StatusCode::NOT_FOUND, format!("unknown channel: {}", platform))
        }
        Error::TaskNotFound(id) => {
            error_response(StatusCode::NOT_FOUND, format!("Task not found: {}", id))
        }
        Error::NoWorkerAvailable(message) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, message)
        }
        Error::Conflict(message) => error_response(StatusCode::CONFLICT, message),
        Error::InvalidInput(message) => error_response(StatusCode::BAD_REQUEST, message),
        other => internal_error(other),
    }
}

pub fn internal_error(err: impl std::fmt::Display) -> RouteError {
    error!("Internal error: {}", err);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

fn handle_panic(_panic: Box<dyn Any + Send + 'static>) -> Response {
    error!("Request handler panicked");
    internal_error("handler panicked").into_response()
}

/// Build the full HTTP/WS surface.
pub fn app(state: GatewayState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(task::router())
        .merge(channels::router())
        .merge(gateway::router())
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin),
        )
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    pub async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&body).to_string())
            })
        };
        (status, value)
    }

    pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }
}
