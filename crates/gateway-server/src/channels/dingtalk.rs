//! DingTalk robot webhook channel

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use vg_core::message::CanonicalMessage;
use vg_core::{ChannelSendError, VerificationError};

use super::{check_timestamp, parse_timestamp, ChannelAdapter, InboundRequest, VerifiedPayload};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct DingTalkConfig {
    pub app_secret: String,
    pub timestamp_ttl: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DingTalkMessage {
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    msgtype: String,
    conversation_id: String,
    #[serde(default)]
    conversation_type: Option<String>,
    #[serde(default)]
    sender_staff_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    sender_nick: Option<String>,
    #[serde(default)]
    text: Option<DingTalkText>,
    #[serde(default)]
    session_webhook: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DingTalkText {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct DingTalkSendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

pub struct DingTalkAdapter {
    config: DingTalkConfig,
    client: reqwest::Client,
    /// conversation id -> reply webhook from the latest inbound message
    session_webhooks: Mutex<HashMap<String, String>>,
}

impl DingTalkAdapter {
    pub fn new(config: DingTalkConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            session_webhooks: Mutex::new(HashMap::new()),
        }
    }

    /// `base64(HMAC-SHA256(secret, "{timestamp}\n{secret}"))`
    pub fn sign(&self, timestamp_ms: i64) -> String {
        let secret = self.config.app_secret.as_bytes();
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(format!("{}\n{}", timestamp_ms, self.config.app_secret).as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn verify_at(
        &self,
        request: &InboundRequest,
        now_ms: i64,
    ) -> Result<VerifiedPayload, VerificationError> {
        let raw_timestamp = request
            .header("timestamp")
            .ok_or(VerificationError::MissingField("timestamp"))?;
        let signature = request
            .header("sign")
            .ok_or(VerificationError::MissingField("sign"))?;
        let timestamp_ms = parse_timestamp(raw_timestamp)?;

        check_timestamp(
            timestamp_ms / 1000,
            now_ms / 1000,
            self.config.timestamp_ttl.as_secs(),
        )?;

        let expected = self.sign(timestamp_ms);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(VerificationError::BadSignature);
        }

        Ok(VerifiedPayload {
            body: request.body.clone(),
        })
    }

    fn session_webhook(&self, conversation_id: &str) -> Option<String> {
        self.session_webhooks.lock().get(conversation_id).cloned()
    }
}

#[async_trait]
impl ChannelAdapter for DingTalkAdapter {
    fn id(&self) -> &'static str {
        "dingtalk"
    }

    fn verify(&self, request: &InboundRequest) -> Result<VerifiedPayload, VerificationError> {
        self.verify_at(request, Utc::now().timestamp_millis())
    }

    fn parse_webhook(
        &self,
        payload: &VerifiedPayload,
    ) -> Result<Option<CanonicalMessage>, VerificationError> {
        let message: DingTalkMessage = serde_json::from_str(&payload.body)
            .map_err(|err| VerificationError::Malformed(err.to_string()))?;

        if let Some(webhook) = &message.session_webhook {
            self.session_webhooks
                .lock()
                .insert(message.conversation_id.clone(), webhook.clone());
        }

        if message.msgtype != "text" {
            debug!("Ignoring DingTalk {} message", message.msgtype);
            return Ok(None);
        }
        let text = message
            .text
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Ok(None);
        }

        let sender_id = message
            .sender_staff_id
            .or(message.sender_id)
            .ok_or(VerificationError::MissingField("senderId"))?;

        let mut canonical =
            CanonicalMessage::new("dingtalk", message.conversation_id, sender_id, text)
                .with_raw_metadata(serde_json::json!({
                    "conversationType": message.conversation_type,
                    "senderNick": message.sender_nick,
                }));
        if let Some(msg_id) = message.msg_id {
            canonical = canonical.with_message_id(msg_id);
        }
        Ok(Some(canonical))
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), ChannelSendError> {
        let webhook = self
            .session_webhook(conversation_id)
            .ok_or_else(|| ChannelSendError::NoRoute(conversation_id.to_string()))?;

        let response = self
            .client
            .post(&webhook)
            .json(&serde_json::json!({
                "msgtype": "text",
                "text": { "content": content },
            }))
            .send()
            .await
            .map_err(ChannelSendError::http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("DingTalk reply failed with {}: {}", status, body);
            return Err(ChannelSendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: DingTalkSendResponse = response.json().await.map_err(ChannelSendError::http)?;
        if body.errcode != 0 {
            return Err(ChannelSendError::Platform {
                code: body.errcode,
                message: body.errmsg,
            });
        }
        debug!("DingTalk reply delivered to {}", conversation_id);
        Ok(())
    }
}
