//! Built-in web channel: browsers post JSON and follow the conversation's
//! event stream.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use vg_core::message::{Attachment, CanonicalMessage};
use vg_core::{ChannelSendError, VerificationError};

use super::{ChannelAdapter, InboundRequest, VerifiedPayload};
use crate::gateway::protocol::{StreamEvent, StreamEventType};
use crate::stream::StreamHub;

/// Body of `POST /api/channels/web/message`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebMessageBody {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

pub struct WebAdapter {
    hub: StreamHub,
}

impl WebAdapter {
    pub fn new(hub: StreamHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ChannelAdapter for WebAdapter {
    fn id(&self) -> &'static str {
        "web"
    }

    // Same-origin clients; nothing to sign.
    fn verify(&self, request: &InboundRequest) -> Result<VerifiedPayload, VerificationError> {
        Ok(VerifiedPayload {
            body: request.body.clone(),
        })
    }

    fn parse_webhook(
        &self,
        payload: &VerifiedPayload,
    ) -> Result<Option<CanonicalMessage>, VerificationError> {
        let body: WebMessageBody = serde_json::from_str(&payload.body)
            .map_err(|err| VerificationError::Malformed(err.to_string()))?;
        if body.text.trim().is_empty() {
            return Err(VerificationError::MissingField("text"));
        }

        let conversation_id = body
            .conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sender_id = body.sender_id.unwrap_or_else(|| "web-user".to_string());

        let mut message = CanonicalMessage::new("web", conversation_id, sender_id, body.text)
            .with_attachments(body.attachments);
        if let Some(message_id) = body.message_id {
            message = message.with_message_id(message_id);
        }
        Ok(Some(message))
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), ChannelSendError> {
        let event = StreamEvent::conversation(StreamEventType::Message, content);
        self.hub.publish(conversation_id, &event);
        Ok(())
    }

    fn delivers_replies(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn parse(body: &str) -> Result<Option<CanonicalMessage>, VerificationError> {
        let adapter = WebAdapter::new(StreamHub::new());
        let payload = adapter
            .verify(&InboundRequest::default().with_body(body))
            .unwrap();
        adapter.parse_webhook(&payload)
    }

    #[test]
    fn keeps_supplied_conversation_id() {
        let message = parse(r#"{"conversationId":"c-1","text":"hello","senderId":"alice"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(message.channel_id, "web");
        assert_eq!(message.conversation_id, "c-1");
        assert_eq!(message.sender_id, "alice");
        assert!(message.message_id.is_none());
    }

    #[test]
    fn assigns_conversation_id_when_missing() {
        let message = parse(r#"{"text":"hello"}"#).unwrap().unwrap();
        assert!(Uuid::parse_str(&message.conversation_id).is_ok());
        assert_eq!(message.sender_id, "web-user");
    }

    #[test]
    fn rejects_empty_text_and_bad_json() {
        assert_eq!(
            parse(r#"{"text":"  "}"#).unwrap_err(),
            VerificationError::MissingField("text")
        );
        assert!(matches!(
            parse("not json").unwrap_err(),
            VerificationError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn send_publishes_to_conversation_stream() {
        let hub = StreamHub::new();
        let adapter = WebAdapter::new(hub.clone());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _sub = hub.register_listener("c-1", move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        adapter.send_message("c-1", "hi there").await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].event_type, StreamEventType::Message);
        assert_eq!(received[0].content.as_deref(), Some("hi there"));
    }
}
