//! Stream Hub and its SSE/WebSocket subscriber bindings

pub mod hub;
pub mod sse;

pub use hub::StreamHub;
pub use sse::{forward_to_websocket, sse_stream};
