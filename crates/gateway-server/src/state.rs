//! Application state

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::broker::TaskBroker;
use crate::channels::dingtalk::DingTalkAdapter;
use crate::channels::web::WebAdapter;
use crate::channels::wecom::WeComAdapter;
use crate::channels::{ChannelRegistry, DedupeCache};
use crate::config::GatewayConfig;
use crate::gateway::registry::ConnectionRegistry;
use crate::stream::StreamHub;

/// Shared application state
#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<GatewayStateInner>,
}

struct GatewayStateInner {
    config: GatewayConfig,
    connections: Arc<ConnectionRegistry>,
    broker: Arc<TaskBroker>,
    hub: StreamHub,
    channels: ChannelRegistry,
    started_at: DateTime<Utc>,
}

impl GatewayState {
    /// Wire up the components and every configured channel adapter.
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let hub = StreamHub::new();
        let connections = Arc::new(ConnectionRegistry::new());
        let broker = Arc::new(TaskBroker::new(Arc::clone(&connections), hub.clone()));

        let mut channels = ChannelRegistry::new(
            Arc::clone(&broker),
            DedupeCache::new(config.dedupe_ttl, config.dedupe_max_entries),
            config.verify_timeout,
        );
        channels.register(Arc::new(WebAdapter::new(hub.clone())));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        if let Some(dingtalk) = &config.dingtalk {
            channels.register(Arc::new(DingTalkAdapter::new(dingtalk.clone(), client.clone())));
        }
        if let Some(wecom) = &config.wecom {
            let adapter = WeComAdapter::new(wecom.clone(), client.clone())
                .context("invalid WeCom configuration")?;
            channels.register(Arc::new(adapter));
        }

        Ok(Self {
            inner: Arc::new(GatewayStateInner {
                config,
                connections,
                broker,
                hub,
                channels,
                started_at: Utc::now(),
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.connections
    }

    pub fn broker(&self) -> &Arc<TaskBroker> {
        &self.inner.broker
    }

    pub fn hub(&self) -> &StreamHub {
        &self.inner.hub
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }
}
