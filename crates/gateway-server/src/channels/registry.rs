//! Channel Registry - adapter lookup, verification and routing of inbound
//! messages into the Task Broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use vg_core::message::CanonicalMessage;
use vg_core::{ChannelSendError, Error, Result, VerificationError};

use super::{ChannelAdapter, InboundRequest};
use crate::broker::{RouteOutcome, TaskBroker};

struct DedupeEntry {
    inserted_at: Instant,
}

/// Recently seen message ids, bounded by age and count.
pub struct DedupeCache {
    entries: HashMap<String, DedupeEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupeCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns true if the key is a duplicate (already seen within TTL).
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        self.evict_expired();
        if self.entries.contains_key(key) {
            return true;
        }
        if self.entries.len() >= self.max_entries {
            if let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest_key);
            }
        }
        self.entries.insert(
            key.to_string(),
            DedupeEntry {
                inserted_at: Instant::now(),
            },
        );
        false
    }

    /// Drop a key so a redelivery is processed again.
    pub fn forget(&mut self, key: &str) {
        self.entries.remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries
            .retain(|_, v| now.duration_since(v.inserted_at) < ttl);
    }
}

/// Channel Registry - owns the adapters and the inbound dedupe window
pub struct ChannelRegistry {
    adapters: HashMap<&'static str, Arc<dyn ChannelAdapter>>,
    dedupe: Mutex<DedupeCache>,
    broker: Arc<TaskBroker>,
    verify_timeout: Duration,
}

impl ChannelRegistry {
    pub fn new(broker: Arc<TaskBroker>, dedupe: DedupeCache, verify_timeout: Duration) -> Self {
        Self {
            adapters: HashMap::new(),
            dedupe: Mutex::new(dedupe),
            broker,
            verify_timeout,
        }
    }

    /// Add an adapter; a later registration under the same id wins.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        info!("Channel adapter registered: {}", adapter.id());
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn get(&self, platform: &str) -> Result<Arc<dyn ChannelAdapter>> {
        self.adapters
            .get(platform)
            .cloned()
            .ok_or_else(|| Error::ChannelNotFound(platform.to_string()))
    }

    /// Registered adapter ids, sorted.
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.adapters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Verify and parse an inbound webhook.
    ///
    /// Verification is bounded by the configured deadline; running past it
    /// rejects the request like any other verification failure.
    pub async fn accept(
        &self,
        platform: &str,
        request: InboundRequest,
    ) -> Result<Option<CanonicalMessage>> {
        let adapter = self.get(platform)?;
        let payload = self
            .run_bounded(platform, "webhook", Arc::clone(&adapter), move |verifier| {
                verifier.verify(&request)
            })
            .await?;

        Ok(adapter.parse_webhook(&payload)?)
    }

    /// Answer a platform URL-verification handshake. Creates no task.
    ///
    /// Held to the same deadline as webhook verification.
    pub async fn verify_url(&self, platform: &str, request: InboundRequest) -> Result<String> {
        let adapter = self.get(platform)?;
        self.run_bounded(platform, "URL verification", adapter, move |verifier| {
            verifier.verify_url(&request)
        })
        .await
    }

    /// Run a signature/decrypt step off the async workers, within
    /// `verify_timeout`.
    async fn run_bounded<T, F>(
        &self,
        platform: &str,
        what: &str,
        adapter: Arc<dyn ChannelAdapter>,
        check: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ChannelAdapter) -> std::result::Result<T, VerificationError>
            + Send
            + 'static,
    {
        let task = tokio::task::spawn_blocking(move || check(adapter.as_ref()));

        match tokio::time::timeout(self.verify_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(VerificationError::Malformed(join_err.to_string())),
            Err(_) => Err(VerificationError::Timeout),
        }
        .map_err(|err| {
            warn!("Rejected {} {}: {}", platform, what, err);
            Error::Verification(err)
        })
    }

    /// Hand a canonical message to the broker, dropping redeliveries.
    pub async fn route_message(&self, message: CanonicalMessage) -> Result<RouteOutcome> {
        let key = message.dedupe_key();
        if let Some(key) = &key {
            if self.dedupe.lock().check_and_insert(key) {
                debug!("Dropping duplicate message {}", key);
                return Ok(RouteOutcome::Duplicate);
            }
        }

        match self.broker.route_message(&message).await {
            Ok(outcome) => {
                info!(
                    "Routed {} message in {} ({:?})",
                    message.channel_id, message.conversation_id, outcome
                );
                Ok(outcome)
            }
            Err(err) => {
                // Let the platform's retry go through.
                if let Some(key) = &key {
                    self.dedupe.lock().forget(key);
                }
                Err(err)
            }
        }
    }

    /// Verify, parse and route one webhook delivery.
    pub async fn handle_webhook(
        &self,
        platform: &str,
        request: InboundRequest,
    ) -> Result<RouteOutcome> {
        match self.accept(platform, request).await? {
            Some(message) => self.route_message(message).await,
            None => {
                debug!("{} webhook carried nothing to route", platform);
                Ok(RouteOutcome::Ignored)
            }
        }
    }

    /// Deliver a reply through the conversation's own channel.
    pub async fn send_reply(
        &self,
        platform: &str,
        conversation_id: &str,
        content: &str,
    ) -> std::result::Result<(), ChannelSendError> {
        let adapter = self
            .adapters
            .get(platform)
            .ok_or_else(|| ChannelSendError::NotConfigured(platform.to_string()))?;
        if !adapter.delivers_replies() {
            return Ok(());
        }
        adapter.send_message(conversation_id, content).await
    }
}
