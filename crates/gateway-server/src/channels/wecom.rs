//! WeCom (企业微信) self-built application channel

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use vg_core::message::{Attachment, CanonicalMessage};
use vg_core::{ChannelSendError, VerificationError};

use super::wecom_crypto::WeComCrypto;
use super::{check_timestamp, parse_timestamp, ChannelAdapter, InboundRequest, VerifiedPayload};

pub use super::wecom_crypto::CryptoError;

/// Group chats are addressed as `group:{chatid}`, users by their user id.
const GROUP_PREFIX: &str = "group:";

/// errcodes meaning the cached access token is no longer valid
const TOKEN_EXPIRED_CODES: [i64; 3] = [40014, 42001, 41001];

#[derive(Debug, Clone)]
pub struct WeComConfig {
    pub token: String,
    pub encoding_aes_key: String,
    pub corp_id: String,
    pub corp_secret: Option<String>,
    pub agent_id: Option<i64>,
    pub api_base: String,
    pub timestamp_ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct EncryptedEnvelope {
    #[serde(alias = "Encrypt")]
    encrypt: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct WeComAdapter {
    config: WeComConfig,
    crypto: WeComCrypto,
    client: reqwest::Client,
    access_token: Mutex<Option<CachedToken>>,
}

impl WeComAdapter {
    pub fn new(config: WeComConfig, client: reqwest::Client) -> Result<Self, CryptoError> {
        let crypto = WeComCrypto::new(&config.token, &config.encoding_aes_key, &config.corp_id)?;
        Ok(Self {
            config,
            crypto,
            client,
            access_token: Mutex::new(None),
        })
    }

    /// Check freshness and signature of a query-signed request over
    /// `encrypted`, then decrypt it.
    fn open(
        &self,
        request: &InboundRequest,
        encrypted: &str,
        now_secs: i64,
    ) -> Result<String, VerificationError> {
        let signature = request
            .query_param("msg_signature")
            .ok_or(VerificationError::MissingField("msg_signature"))?;
        let raw_timestamp = request
            .query_param("timestamp")
            .ok_or(VerificationError::MissingField("timestamp"))?;
        let nonce = request
            .query_param("nonce")
            .ok_or(VerificationError::MissingField("nonce"))?;

        let timestamp = parse_timestamp(raw_timestamp)?;
        check_timestamp(timestamp, now_secs, self.config.timestamp_ttl.as_secs())?;

        if !self
            .crypto
            .verify_signature(signature, raw_timestamp, nonce, encrypted)
        {
            return Err(VerificationError::BadSignature);
        }

        Ok(self.crypto.decrypt(encrypted)?)
    }

    fn verify_at(
        &self,
        request: &InboundRequest,
        now_secs: i64,
    ) -> Result<VerifiedPayload, VerificationError> {
        let encrypted = extract_encrypted(&request.body)?;
        let body = self.open(request, &encrypted, now_secs)?;
        Ok(VerifiedPayload { body })
    }

    fn verify_url_at(
        &self,
        request: &InboundRequest,
        now_secs: i64,
    ) -> Result<String, VerificationError> {
        let echostr = request
            .query_param("echostr")
            .ok_or(VerificationError::MissingField("echostr"))?;
        self.open(request, echostr, now_secs)
    }

    async fn access_token(&self) -> Result<String, ChannelSendError> {
        let cached = self
            .access_token
            .lock()
            .as_ref()
            .filter(|token| token.expires_at > Instant::now())
            .map(|token| token.value.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let secret = self
            .config
            .corp_secret
            .as_deref()
            .ok_or_else(|| ChannelSendError::NotConfigured("WECOM_CORP_SECRET".to_string()))?;
        let url = format!(
            "{}/cgi-bin/gettoken?corpid={}&corpsecret={}",
            self.config.api_base.trim_end_matches('/'),
            urlencoding::encode(&self.config.corp_id),
            urlencoding::encode(secret)
        );

        let response: TokenResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ChannelSendError::http)?
            .json()
            .await
            .map_err(ChannelSendError::http)?;
        if response.errcode != 0 {
            return Err(ChannelSendError::Platform {
                code: response.errcode,
                message: response.errmsg,
            });
        }

        // Refresh a minute early.
        let lifetime = Duration::from_secs(response.expires_in.saturating_sub(60).max(60));
        *self.access_token.lock() = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        info!("WeCom access token refreshed");
        Ok(response.access_token)
    }

    fn outbound_request(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> (&'static str, serde_json::Value) {
        match conversation_id.strip_prefix(GROUP_PREFIX) {
            Some(chat_id) => (
                "/cgi-bin/appchat/send",
                serde_json::json!({
                    "chatid": chat_id,
                    "msgtype": "text",
                    "text": { "content": content },
                }),
            ),
            None => (
                "/cgi-bin/message/send",
                serde_json::json!({
                    "touser": conversation_id,
                    "msgtype": "text",
                    "agentid": self.config.agent_id,
                    "text": { "content": content },
                }),
            ),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WeComAdapter {
    fn id(&self) -> &'static str {
        "wecom"
    }

    fn verify(&self, request: &InboundRequest) -> Result<VerifiedPayload, VerificationError> {
        self.verify_at(request, Utc::now().timestamp())
    }

    fn parse_webhook(
        &self,
        payload: &VerifiedPayload,
    ) -> Result<Option<CanonicalMessage>, VerificationError> {
        let xml = payload.body.as_str();
        let msg_type = xml_field(xml, "MsgType").ok_or(VerificationError::MissingField("MsgType"))?;
        let sender_id =
            xml_field(xml, "FromUserName").ok_or(VerificationError::MissingField("FromUserName"))?;

        let (text, attachments) = match msg_type.as_str() {
            "text" => (xml_field(xml, "Content").unwrap_or_default(), Vec::new()),
            "image" => {
                let url = xml_field(xml, "PicUrl").ok_or(VerificationError::MissingField("PicUrl"))?;
                (
                    "[image]".to_string(),
                    vec![Attachment {
                        kind: "image".to_string(),
                        url,
                        name: xml_field(xml, "MediaId"),
                    }],
                )
            }
            other => {
                debug!("Ignoring WeCom {} message", other);
                return Ok(None);
            }
        };
        if text.trim().is_empty() {
            return Ok(None);
        }

        let conversation_id = match xml_field(xml, "ChatId") {
            Some(chat_id) => format!("{}{}", GROUP_PREFIX, chat_id),
            None => sender_id.clone(),
        };

        let mut message = CanonicalMessage::new("wecom", conversation_id, sender_id, text.trim())
            .with_attachments(attachments)
            .with_raw_metadata(serde_json::json!({
                "agentId": xml_field(xml, "AgentID"),
                "msgType": msg_type,
            }));
        if let Some(msg_id) = xml_field(xml, "MsgId") {
            message = message.with_message_id(msg_id);
        }
        Ok(Some(message))
    }

    fn verify_url(&self, request: &InboundRequest) -> Result<String, VerificationError> {
        self.verify_url_at(request, Utc::now().timestamp())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), ChannelSendError> {
        let token = self.access_token().await?;
        let (path, body) = self.outbound_request(conversation_id, content);
        let url = format!(
            "{}{}?access_token={}",
            self.config.api_base.trim_end_matches('/'),
            path,
            urlencoding::encode(&token)
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ChannelSendError::http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelSendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: ApiResponse = response.json().await.map_err(ChannelSendError::http)?;
        if result.errcode != 0 {
            if TOKEN_EXPIRED_CODES.contains(&result.errcode) {
                self.access_token.lock().take();
            }
            warn!(
                "WeCom send to {} failed: {} {}",
                conversation_id, result.errcode, result.errmsg
            );
            return Err(ChannelSendError::Platform {
                code: result.errcode,
                message: result.errmsg,
            });
        }
        debug!("WeCom reply delivered to {}", conversation_id);
        Ok(())
    }
}

/// Pull the ciphertext out of an XML (`<Encrypt>`) or JSON (`encrypt`)
/// callback body.
fn extract_encrypted(body: &str) -> Result<String, VerificationError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        let envelope: EncryptedEnvelope = serde_json::from_str(trimmed)
            .map_err(|err| VerificationError::Malformed(err.to_string()))?;
        return Ok(envelope.encrypt);
    }
    xml_field(trimmed, "Encrypt").ok_or(VerificationError::MissingField("Encrypt"))
}

/// Text of the first `<tag>` element, with a CDATA wrapper removed.
///
/// WeCom callbacks are flat, attribute-free XML, which is all this handles.
fn xml_field(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    let inner = xml[start..end].trim();

    let value = inner
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
        .unwrap_or(inner);
    Some(value.to_string())
}
