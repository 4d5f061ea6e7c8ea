//! WebSocket handler for worker connections

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vg_core::task::{Task, TaskStatus, TaskUpdate};

use super::protocol::{GatewayFrame, WorkerFrame};
use super::registry::{ConnectedWorker, WorkerHandle};
use crate::broker::EventOutcome;
use crate::state::GatewayState;

const WORKER_DISCONNECTED: &str = "worker disconnected";

/// Time the writer gets to flush queued frames after the read side ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler
pub async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_worker_socket(socket, state))
        .into_response()
}

/// Handle an individual worker WebSocket connection
async fn handle_worker_socket(socket: WebSocket, state: GatewayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending frames to this worker
    let (tx, mut rx) = mpsc::unbounded_channel::<GatewayFrame>();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let rejected = matches!(frame, GatewayFrame::Registered { ok: false, .. });
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                }
            }
            if rejected {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let mut session = WorkerSession::new(tx);
    let kick = Arc::clone(&session.kick);
    debug!("Worker connection {} opened", session.conn_id);

    loop {
        tokio::select! {
            _ = kick.notified() => {
                info!("Closing connection {} of worker {}", session.conn_id, session.label());
                break;
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WorkerFrame>(&text) {
                        Ok(frame) => {
                            if session.handle_frame(&state, frame).await == FrameAction::Close {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse frame from {}: {}", session.label(), e);
                            if session.reject_unregistered("malformed frame") == FrameAction::Close {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Worker {} sent close frame", session.label());
                    break;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    debug!("Transport ping/pong from {}", session.label());
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Unexpected binary message from {}", session.label());
                }
                Some(Err(e)) => {
                    error!("WebSocket error from {}: {}", session.label(), e);
                    break;
                }
                None => break,
            }
        }
    }

    // Cleanup on disconnect
    session.close(&state).await;
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameAction {
    Continue,
    Close,
}

/// Per-connection protocol state
struct WorkerSession {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayFrame>,
    kick: Arc<Notify>,
    /// Set once the `connected` handshake succeeded.
    worker_id: Option<String>,
}

impl WorkerSession {
    fn new(tx: mpsc::UnboundedSender<GatewayFrame>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            tx,
            kick: Arc::new(Notify::new()),
            worker_id: None,
        }
    }

    fn label(&self) -> &str {
        self.worker_id.as_deref().unwrap_or("<unregistered>")
    }

    async fn handle_frame(&mut self, state: &GatewayState, frame: WorkerFrame) -> FrameAction {
        let Some(worker_id) = self.worker_id.clone() else {
            return self.handshake(state, frame).await;
        };
        debug!("{} from worker {}", frame.type_name(), worker_id);

        match frame {
            WorkerFrame::Connected { .. } => {
                warn!("Worker {} repeated its handshake, ignoring", worker_id);
            }
            WorkerFrame::TaskStarted { task_id } => {
                apply_update(state, &worker_id, task_id, TaskUpdate::Started).await;
            }
            WorkerFrame::TaskProgress {
                task_id,
                content,
                data,
            } => {
                apply_update(state, &worker_id, task_id, TaskUpdate::Progress { content, data })
                    .await;
            }
            WorkerFrame::TaskCompleted { task_id, result } => {
                apply_update(state, &worker_id, task_id, TaskUpdate::Completed { result }).await;
            }
            WorkerFrame::TaskError { task_id, error } => {
                apply_update(
                    state,
                    &worker_id,
                    task_id,
                    TaskUpdate::Error { message: error },
                )
                .await;
            }
            WorkerFrame::Heartbeat { .. } | WorkerFrame::Pong { .. } => {
                state
                    .connections()
                    .record_pong(&worker_id, self.conn_id)
                    .await;
            }
        }
        FrameAction::Continue
    }

    async fn handshake(&mut self, state: &GatewayState, frame: WorkerFrame) -> FrameAction {
        let frame_type = frame.type_name();
        let WorkerFrame::Connected {
            worker_id,
            name,
            version,
            platform,
            capabilities,
        } = frame
        else {
            warn!(
                "Expected connected handshake on {}, got {}",
                self.conn_id, frame_type
            );
            return self.reject_unregistered(&format!(
                "expected connected handshake, got {}",
                frame_type
            ));
        };

        if worker_id.trim().is_empty() {
            return self.reject_unregistered("workerId is required");
        }

        let handle = WorkerHandle::new(worker_id.clone(), self.conn_id, self.tx.clone());
        let worker = ConnectedWorker::new(
            handle,
            Arc::clone(&self.kick),
            name,
            version,
            platform,
            capabilities,
        );
        state.connections().register(worker).await;
        let _ = self.tx.send(GatewayFrame::Registered {
            ok: true,
            error: None,
        });
        self.worker_id = Some(worker_id);
        FrameAction::Continue
    }

    /// Refuse a connection that has not completed its handshake. Registered
    /// connections just skip the bad frame.
    fn reject_unregistered(&self, reason: &str) -> FrameAction {
        if self.worker_id.is_some() {
            return FrameAction::Continue;
        }
        let _ = self.tx.send(GatewayFrame::Registered {
            ok: false,
            error: Some(reason.to_string()),
        });
        FrameAction::Close
    }

    async fn close(self, state: &GatewayState) {
        let Some(worker_id) = self.worker_id else {
            debug!("Unregistered connection {} closed", self.conn_id);
            return;
        };

        info!("Worker {} disconnected", worker_id);
        if state.connections().unregister(&worker_id, self.conn_id).await {
            on_worker_gone(state, worker_id, self.conn_id).await;
        }
    }
}

async fn apply_update(state: &GatewayState, worker_id: &str, task_id: Uuid, update: TaskUpdate) {
    match state
        .broker()
        .on_worker_event(worker_id, task_id, update)
        .await
    {
        Ok(EventOutcome::Finished(task)) => deliver_reply(state, task),
        Ok(_) => {}
        Err(err) => warn!(
            "Dropping event from worker {} for task {}: {}",
            worker_id, task_id, err
        ),
    }
}

/// Push a finished task's outcome back into the conversation it came from.
/// Runs detached; a failed send is logged and never touches the task.
fn deliver_reply(state: &GatewayState, task: Task) {
    let task_id = task.id;
    let (Some(channel_id), Some(conversation_id)) = (task.channel_id, task.conversation_id) else {
        return;
    };
    let content = match task.status {
        TaskStatus::Completed => task.result.unwrap_or_default(),
        TaskStatus::Error => format!(
            "Task failed: {}",
            task.error_message.unwrap_or_default()
        ),
        _ => return,
    };

    let state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = state
            .channels()
            .send_reply(&channel_id, &conversation_id, &content)
            .await
        {
            error!(
                "Failed to deliver reply for task {} to {} {}: {}",
                task_id, channel_id, conversation_id, err
            );
        }
    });
}

/// Fail or hold the tasks of a worker whose connection `conn_id` is gone.
///
/// With a grace window the tasks fail only if that window expires without
/// the worker reconnecting; a later disconnect starts a fresh full window.
async fn on_worker_gone(state: &GatewayState, worker_id: String, conn_id: Uuid) {
    match state.config().worker_grace {
        None => {
            state
                .broker()
                .fail_worker_tasks(&worker_id, WORKER_DISCONNECTED)
                .await;
        }
        Some(grace) => {
            info!(
                "Holding tasks of worker {} for {:?} in case it reconnects",
                worker_id, grace
            );
            state.connections().mark_departed(&worker_id, conn_id);
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if state.connections().expire_departure(&worker_id, conn_id).await {
                    state
                        .broker()
                        .fail_worker_tasks(&worker_id, WORKER_DISCONNECTED)
                        .await;
                }
            });
        }
    }
}

/// Start the heartbeat checker background task
pub fn start_heartbeat_checker(state: GatewayState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = state.config().heartbeat_interval;
        let max_missed = state.config().max_missed_pongs;
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            for worker in state.connections().sweep(max_missed).await {
                on_worker_gone(&state, worker.id.clone(), worker.conn_id()).await;
            }
        }
    })
}
