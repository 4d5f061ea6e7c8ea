//! Error types for the core library

use thiserror::Error;

/// Gateway-wide error taxonomy.
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound request failed signature, timestamp or decrypt checks.
    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("No worker available: {0}")]
    NoWorkerAvailable(String),

    /// Worker connection dropped or could not be written to.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Operation is not valid for the task's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Why an inbound channel request was rejected.
///
/// Every variant fails closed: the request is answered with 403 and no task
/// is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("signature mismatch")]
    BadSignature,

    #[error("timestamp {timestamp} outside the {ttl_secs}s replay window")]
    Expired { timestamp: i64, ttl_secs: u64 },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("receiver id mismatch")]
    ReceiverMismatch,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("verification timed out")]
    Timeout,

    #[error("operation not supported by this channel")]
    Unsupported,
}

/// Outbound delivery to a channel failed. Never affects task state.
#[derive(Error, Debug)]
pub enum ChannelSendError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("platform returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("platform error {code}: {message}")]
    Platform { code: i64, message: String },

    #[error("no delivery route for conversation {0}")]
    NoRoute(String),

    #[error("channel not configured: {0}")]
    NotConfigured(String),
}

impl ChannelSendError {
    pub fn http(err: impl std::fmt::Display) -> Self {
        Self::Http(err.to_string())
    }
}
