//! Channel adapters - translate external chat platforms to and from the
//! canonical message model.

pub mod dingtalk;
pub mod registry;
pub mod web;
pub mod wecom;
pub(crate) mod wecom_crypto;

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;

use vg_core::message::CanonicalMessage;
use vg_core::{ChannelSendError, VerificationError};

pub use registry::{ChannelRegistry, DedupeCache};

/// Raw inbound webhook, detached from the HTTP framework.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: String,
}

impl InboundRequest {
    pub fn new(headers: &HeaderMap, query: HashMap<String, String>, body: String) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self {
            headers,
            query,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

#[cfg(test)]
impl InboundRequest {
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Payload that passed an adapter's authenticity check, already decrypted
/// where the platform encrypts.
#[derive(Debug, Clone)]
pub struct VerifiedPayload {
    pub body: String,
}

/// One external chat platform.
///
/// `verify` runs on a blocking thread under a deadline, so it must not
/// touch async state.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Registry key and path segment, e.g. `"dingtalk"`.
    fn id(&self) -> &'static str;

    /// Check signature and timestamp freshness, decrypting if needed.
    fn verify(&self, request: &InboundRequest) -> Result<VerifiedPayload, VerificationError>;

    /// Map a verified payload to a canonical message. `Ok(None)` means the
    /// payload is valid but carries nothing to route (events, non-text).
    fn parse_webhook(
        &self,
        payload: &VerifiedPayload,
    ) -> Result<Option<CanonicalMessage>, VerificationError>;

    /// Answer a platform URL-verification handshake with the exact string
    /// the platform expects back.
    fn verify_url(&self, _request: &InboundRequest) -> Result<String, VerificationError> {
        Err(VerificationError::Unsupported)
    }

    /// Deliver an outbound reply into `conversation_id`.
    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), ChannelSendError>;

    /// Whether task results should be pushed back through `send_message`.
    /// Channels whose clients already follow the event stream say no.
    fn delivers_replies(&self) -> bool {
        true
    }
}

/// Reject timestamps (seconds) further than `ttl_secs` from `now`, in
/// either direction.
pub(crate) fn check_timestamp(
    timestamp: i64,
    now: i64,
    ttl_secs: u64,
) -> Result<(), VerificationError> {
    if now.abs_diff(timestamp) > ttl_secs {
        return Err(VerificationError::Expired { timestamp, ttl_secs });
    }
    Ok(())
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<i64, VerificationError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| VerificationError::InvalidTimestamp(raw.to_string()))
}
