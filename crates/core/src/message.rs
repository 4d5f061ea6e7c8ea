//! Canonical message model
//!
//! Every channel adapter translates its platform's wire format into a
//! [`CanonicalMessage`] before anything else in the gateway sees it.

use serde::{Deserialize, Serialize};

/// A file or media reference carried alongside the message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Platform-neutral inbound message.
///
/// `conversation_id` is derived from the platform's thread identifier, so
/// redelivery of the same external message always maps to the same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub channel_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    /// Platform-supplied message id, used for at-least-once dedupe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub raw_metadata: serde_json::Value,
}

impl CanonicalMessage {
    pub fn new(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            message_id: None,
            text: text.into(),
            attachments: Vec::new(),
            raw_metadata: serde_json::Value::Null,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_raw_metadata(mut self, raw_metadata: serde_json::Value) -> Self {
        self.raw_metadata = raw_metadata;
        self
    }

    /// Key used to drop redelivered webhooks. `None` when the platform
    /// supplied no message id.
    pub fn dedupe_key(&self) -> Option<String> {
        self.message_id
            .as_ref()
            .map(|id| format!("{}:{}", self.channel_id, id))
    }
}
