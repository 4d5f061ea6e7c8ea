//! Control protocol endpoint for worker connections
//!
//! Workers dial in over WebSocket, register with a `connected` handshake and
//! then exchange task frames with the Task Broker.

pub mod handler;
pub mod protocol;
pub mod registry;

pub use handler::{start_heartbeat_checker, worker_ws_handler};
