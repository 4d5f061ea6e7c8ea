//! Connection Registry - tracks live worker connections

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vg_core::{Error, Result};

use super::protocol::GatewayFrame;

/// Sending half of a worker's transport.
///
/// Cheap to clone; the Task Broker re-resolves one by worker id before every
/// use instead of keeping it.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub conn_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayFrame>,
}

impl WorkerHandle {
    pub fn new(
        worker_id: impl Into<String>,
        conn_id: Uuid,
        tx: mpsc::UnboundedSender<GatewayFrame>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            conn_id,
            tx,
        }
    }

    /// Queue a frame for the connection's writer.
    pub fn send(&self, frame: GatewayFrame) -> Result<()> {
        self.tx.send(frame).map_err(|_| {
            Error::Transport(format!("connection to worker {} is closed", self.worker_id))
        })
    }
}

/// A worker that completed the `connected` handshake
#[derive(Debug)]
pub struct ConnectedWorker {
    pub id: String,
    pub name: String,
    pub version: String,
    pub platform: String,
    pub capabilities: BTreeSet<String>,
    pub connected_at: DateTime<Utc>,
    pub missed_pongs: u32,
    handle: WorkerHandle,
    /// Signalled to make the connection's read loop hang up.
    kick: Arc<Notify>,
}

impl ConnectedWorker {
    pub fn new(
        handle: WorkerHandle,
        kick: Arc<Notify>,
        name: String,
        version: String,
        platform: String,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: handle.worker_id.clone(),
            name,
            version,
            platform,
            capabilities: capabilities.into_iter().collect(),
            connected_at: Utc::now(),
            missed_pongs: 0,
            handle,
            kick,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.handle.conn_id
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    fn disconnect(&self) {
        self.kick.notify_one();
    }
}

/// Worker snapshot for API responses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: String,
    pub name: String,
    pub version: String,
    pub platform: String,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub missed_pongs: u32,
}

impl From<&ConnectedWorker> for WorkerStatus {
    fn from(worker: &ConnectedWorker) -> Self {
        Self {
            id: worker.id.clone(),
            name: worker.name.clone(),
            version: worker.version.clone(),
            platform: worker.platform.clone(),
            capabilities: worker.capabilities.iter().cloned().collect(),
            connected_at: worker.connected_at,
            missed_pongs: worker.missed_pongs,
        }
    }
}

/// Connection Registry - sole owner of [`ConnectedWorker`] records
#[derive(Default)]
pub struct ConnectionRegistry {
    workers: RwLock<HashMap<String, ConnectedWorker>>,
    /// Worker id -> the connection that dropped last, while its grace
    /// window is open.
    departures: Mutex<HashMap<String, Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker after its handshake.
    ///
    /// A worker reconnecting under the same id replaces its old connection,
    /// which is told to hang up.
    pub async fn register(&self, worker: ConnectedWorker) {
        let worker_id = worker.id.clone();
        let mut workers = self.workers.write().await;

        info!(
            "Registering worker: {} ({}, {} {})",
            worker.id, worker.name, worker.platform, worker.version
        );

        if let Some(previous) = workers.insert(worker.id.clone(), worker) {
            warn!(
                "Worker {} already registered, replacing connection {}",
                previous.id,
                previous.conn_id()
            );
            previous.disconnect();
        }
        drop(workers);

        self.departures.lock().remove(&worker_id);
    }

    /// Remove a worker on transport close.
    ///
    /// Only removes the entry when it still belongs to `conn_id`, so the close
    /// of a replaced connection never evicts its successor.
    pub async fn unregister(&self, worker_id: &str, conn_id: Uuid) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get(worker_id) {
            Some(worker) if worker.conn_id() == conn_id => {
                workers.remove(worker_id);
                info!("Worker {} unregistered", worker_id);
                true
            }
            _ => false,
        }
    }

    /// Pick a worker for new work.
    ///
    /// With no target, the longest-connected worker is chosen; there is no
    /// load metric. A named target that is not connected is an error.
    pub async fn select(&self, worker_id: Option<&str>) -> Result<WorkerHandle> {
        let workers = self.workers.read().await;
        match worker_id {
            Some(id) => workers
                .get(id)
                .map(ConnectedWorker::handle)
                .ok_or_else(|| Error::NoWorkerAvailable(format!("worker {} is not connected", id))),
            None => workers
                .values()
                .min_by_key(|w| w.connected_at)
                .map(ConnectedWorker::handle)
                .ok_or_else(|| Error::NoWorkerAvailable("no workers connected".to_string())),
        }
    }

    /// Current handle for a worker id, if it is connected.
    pub async fn resolve(&self, worker_id: &str) -> Option<WorkerHandle> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(ConnectedWorker::handle)
    }

    /// Open a grace window for `worker_id` after `conn_id` dropped. A later
    /// departure of the same worker supersedes this one.
    pub fn mark_departed(&self, worker_id: &str, conn_id: Uuid) {
        self.departures
            .lock()
            .insert(worker_id.to_string(), conn_id);
    }

    /// Close the grace window opened by `conn_id`.
    ///
    /// Returns true when the worker is still gone and no later connection
    /// has reconnected or dropped since, i.e. its tasks should now fail.
    pub async fn expire_departure(&self, worker_id: &str, conn_id: Uuid) -> bool {
        {
            let mut departures = self.departures.lock();
            match departures.get(worker_id) {
                Some(departed) if *departed == conn_id => {
                    departures.remove(worker_id);
                }
                _ => return false,
            }
        }
        !self.contains(worker_id).await
    }

    pub async fn contains(&self, worker_id: &str) -> bool {
        self.workers.read().await.contains_key(worker_id)
    }

    /// Reset the missed-pong counter for a live connection.
    pub async fn record_pong(&self, worker_id: &str, conn_id: Uuid) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            if worker.conn_id() == conn_id {
                worker.missed_pongs = 0;
                debug!("Pong from worker {}", worker_id);
            }
        }
    }

    /// One heartbeat round.
    ///
    /// Workers that already missed `max_missed` pongs (or whose transport is
    /// gone) are removed and returned; every other worker gets a `ping`.
    pub async fn sweep(&self, max_missed: u32) -> Vec<ConnectedWorker> {
        let mut workers = self.workers.write().await;
        let timestamp = Utc::now().timestamp_millis().max(0) as u64;

        let mut stale = Vec::new();
        for worker in workers.values_mut() {
            if worker.missed_pongs >= max_missed {
                stale.push(worker.id.clone());
                continue;
            }
            worker.missed_pongs += 1;
            if worker.handle.send(GatewayFrame::Ping { timestamp }).is_err() {
                stale.push(worker.id.clone());
            }
        }

        stale
            .into_iter()
            .filter_map(|id| workers.remove(&id))
            .inspect(|worker| {
                warn!(
                    "Worker {} missed {} pongs, disconnecting",
                    worker.id, worker.missed_pongs
                );
                worker.disconnect();
            })
            .collect()
    }

    /// List all connected workers
    pub async fn list(&self) -> Vec<WorkerStatus> {
        let workers = self.workers.read().await;
        let mut list: Vec<WorkerStatus> = workers.values().map(WorkerStatus::from).collect();
        list.sort_by_key(|w| w.connected_at);
        list
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }
}
