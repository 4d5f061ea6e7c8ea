//! Gateway configuration read from the environment

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::channels::dingtalk::DingTalkConfig;
use crate::channels::wecom::WeComConfig;

const DEFAULT_WECOM_API_BASE: &str = "https://qyapi.weixin.qq.com";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before a worker is evicted.
    pub max_missed_pongs: u32,
    /// How long a vanished worker's tasks wait for it to reconnect.
    /// `None` fails them immediately.
    pub worker_grace: Option<Duration>,
    pub webhook_ttl: Duration,
    pub verify_timeout: Duration,
    pub dedupe_ttl: Duration,
    pub dedupe_max_entries: usize,
    pub dingtalk: Option<DingTalkConfig>,
    pub wecom: Option<WeComConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
            heartbeat_interval: Duration::from_secs(30),
            max_missed_pongs: 3,
            worker_grace: None,
            webhook_ttl: Duration::from_secs(300),
            verify_timeout: Duration::from_millis(2000),
            dedupe_ttl: Duration::from_secs(600),
            dedupe_max_entries: 10_000,
            dingtalk: None,
            wecom: None,
        }
    }
}

/// Config summary safe to expose (no secrets).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub heartbeat_interval_secs: u64,
    pub max_missed_pongs: u32,
    pub worker_grace_secs: Option<u64>,
    pub dingtalk_enabled: bool,
    pub wecom_enabled: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let webhook_ttl = Duration::from_secs(env_parse(
            "GATEWAY_WEBHOOK_TTL_SECS",
            defaults.webhook_ttl.as_secs(),
        ));

        Self {
            bind: env_parse("GATEWAY_BIND", defaults.bind),
            heartbeat_interval: Duration::from_secs(
                env_parse(
                    "GATEWAY_HEARTBEAT_INTERVAL_SECS",
                    defaults.heartbeat_interval.as_secs(),
                )
                .max(1),
            ),
            max_missed_pongs: env_parse("GATEWAY_MAX_MISSED_PONGS", defaults.max_missed_pongs)
                .max(1),
            worker_grace: env_optional::<u64>("GATEWAY_WORKER_GRACE_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            webhook_ttl,
            verify_timeout: Duration::from_millis(env_parse(
                "GATEWAY_VERIFY_TIMEOUT_MS",
                defaults.verify_timeout.as_millis() as u64,
            )),
            dedupe_ttl: Duration::from_secs(env_parse(
                "GATEWAY_DEDUPE_TTL_SECS",
                defaults.dedupe_ttl.as_secs(),
            )),
            dedupe_max_entries: env_parse(
                "GATEWAY_DEDUPE_MAX_ENTRIES",
                defaults.dedupe_max_entries,
            ),
            dingtalk: dingtalk_from_env(webhook_ttl),
            wecom: wecom_from_env(webhook_ttl),
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            heartbeat_interval_secs: self.heartbeat_interval.as_secs(),
            max_missed_pongs: self.max_missed_pongs,
            worker_grace_secs: self.worker_grace.map(|d| d.as_secs()),
            dingtalk_enabled: self.dingtalk.is_some(),
            wecom_enabled: self.wecom.is_some(),
        }
    }
}

fn dingtalk_from_env(timestamp_ttl: Duration) -> Option<DingTalkConfig> {
    env_string("DINGTALK_APP_SECRET").map(|app_secret| DingTalkConfig {
        app_secret,
        timestamp_ttl,
    })
}

fn wecom_from_env(timestamp_ttl: Duration) -> Option<WeComConfig> {
    let token = env_string("WECOM_TOKEN");
    let encoding_aes_key = env_string("WECOM_ENCODING_AES_KEY");
    let corp_id = env_string("WECOM_CORP_ID");

    match (token, encoding_aes_key, corp_id) {
        (Some(token), Some(encoding_aes_key), Some(corp_id)) => Some(WeComConfig {
            token,
            encoding_aes_key,
            corp_id,
            corp_secret: env_string("WECOM_CORP_SECRET"),
            agent_id: env_optional("WECOM_AGENT_ID"),
            api_base: env_string("WECOM_API_BASE")
                .unwrap_or_else(|| DEFAULT_WECOM_API_BASE.to_string()),
            timestamp_ttl,
        }),
        (None, None, None) => None,
        _ => {
            warn!(
                "WeCom needs WECOM_TOKEN, WECOM_ENCODING_AES_KEY and WECOM_CORP_ID; adapter disabled"
            );
            None
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn env_optional<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_optional(name).unwrap_or(default)
}
