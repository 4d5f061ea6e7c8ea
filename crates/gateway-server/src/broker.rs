//! Task Broker - creates tasks, assigns them to workers and applies worker
//! reported events.
//!
//! Ordering is FIFO per connection, not globally sequenced: events are applied
//! in the order they arrive on the owning worker's connection, and nothing
//! orders events across a reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vg_core::message::CanonicalMessage;
use vg_core::task::{Task, TaskEvent, TaskUpdate};
use vg_core::{Error, Result};

use crate::gateway::protocol::{GatewayFrame, StreamEvent};
use crate::gateway::registry::ConnectionRegistry;
use crate::stream::StreamHub;

/// Result of routing a canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A new task was created for the conversation.
    Created(Uuid),
    /// The message was appended to the conversation's active task.
    Appended(Uuid),
    /// The message id was already seen; nothing was routed.
    Duplicate,
    /// The payload was valid but carried nothing to route.
    Ignored,
}

impl RouteOutcome {
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::Created(id) | Self::Appended(id) => Some(*id),
            Self::Duplicate | Self::Ignored => None,
        }
    }
}

/// Result of applying a worker event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Applied,
    /// The event moved the task into a terminal state; carries a snapshot.
    Finished(Task),
    /// Late or foreign event, logged and dropped.
    Discarded,
}

#[derive(Default)]
struct BrokerInner {
    tasks: HashMap<Uuid, Task>,
    /// Creation order for listing.
    order: Vec<Uuid>,
    /// conversation id -> its single non-terminal task
    active_by_conversation: HashMap<String, Uuid>,
}

impl BrokerInner {
    fn release_conversation(&mut self, task: &Task) {
        if let Some(conversation_id) = &task.conversation_id {
            if self.active_by_conversation.get(conversation_id) == Some(&task.id) {
                self.active_by_conversation.remove(conversation_id);
            }
        }
    }
}

/// Task Broker - exclusive owner of every [`Task`]
pub struct TaskBroker {
    inner: Mutex<BrokerInner>,
    connections: Arc<ConnectionRegistry>,
    hub: StreamHub,
}

impl TaskBroker {
    pub fn new(connections: Arc<ConnectionRegistry>, hub: StreamHub) -> Self {
        Self {
            inner: Mutex::new(BrokerInner::default()),
            connections,
            hub,
        }
    }

    /// Create a task and dispatch it to a worker.
    ///
    /// Fails with `NoWorkerAvailable` before anything is created when no
    /// eligible worker is connected.
    pub async fn submit(&self, goal: String, worker_id: Option<&str>) -> Result<Uuid> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(Error::InvalidInput("goal cannot be empty".to_string()));
        }
        let mut inner = self.inner.lock().await;
        let task = Task::new(goal, "");
        self.dispatch_new(&mut inner, task, worker_id).await
    }

    /// Route a canonical message to its conversation's task.
    ///
    /// Lookup and create happen under one lock, so two messages for the same
    /// conversation can never both create a task.
    pub async fn route_message(&self, message: &CanonicalMessage) -> Result<RouteOutcome> {
        let mut inner = self.inner.lock().await;

        if let Some(task_id) = inner
            .active_by_conversation
            .get(&message.conversation_id)
            .copied()
        {
            self.append_message(&mut inner, task_id, message.text.clone())
                .await?;
            debug!(
                "Appended follow-up from {} to task {}",
                message.conversation_id, task_id
            );
            return Ok(RouteOutcome::Appended(task_id));
        }

        let task = Task::new(message.text.clone(), "")
            .with_conversation(&message.channel_id, &message.conversation_id);
        let task_id = self.dispatch_new(&mut inner, task, None).await?;
        inner
            .active_by_conversation
            .insert(message.conversation_id.clone(), task_id);
        Ok(RouteOutcome::Created(task_id))
    }

    async fn dispatch_new(
        &self,
        inner: &mut BrokerInner,
        mut task: Task,
        worker_id: Option<&str>,
    ) -> Result<Uuid> {
        let handle = self.connections.select(worker_id).await?;
        task.worker_id = handle.worker_id.clone();
        let task_id = task.id;

        let frame = GatewayFrame::TaskSubmit {
            task_id,
            goal: task.goal.clone(),
            conversation_id: task.conversation_id.clone(),
            metadata: serde_json::json!({ "channelId": task.channel_id }),
        };

        if let Err(err) = handle.send(frame) {
            // Never left pending: the task is recorded as failed and the
            // caller decides whether to retry.
            warn!("Failed to dispatch task {} to {}: {}", task_id, handle.worker_id, err);
            let _ = task.apply(TaskUpdate::Error {
                message: format!("dispatch failed: {}", err),
            });
            inner.order.push(task_id);
            inner.tasks.insert(task_id, task);
            return Err(err);
        }

        info!("Task {} dispatched to worker {}", task_id, handle.worker_id);
        if let Some(event) = task.events.last() {
            self.publish(&task, event);
        }
        inner.order.push(task_id);
        inner.tasks.insert(task_id, task);
        Ok(task_id)
    }

    async fn append_message(
        &self,
        inner: &mut BrokerInner,
        task_id: Uuid,
        content: String,
    ) -> Result<()> {
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "task {} is already {}",
                task_id,
                task.status.as_str()
            )));
        }

        let handle = self.connections.resolve(&task.worker_id).await.ok_or_else(|| {
            Error::NoWorkerAvailable(format!("worker {} is not connected", task.worker_id))
        })?;
        handle.send(GatewayFrame::TaskMessage {
            task_id,
            content: content.clone(),
        })?;

        let event = task
            .apply(TaskUpdate::Message { content })
            .map_err(|err| Error::Conflict(err.to_string()))?
            .clone();
        self.publish(task, &event);
        Ok(())
    }

    /// Send a follow-up instruction to an active task.
    pub async fn send_message(&self, task_id: Uuid, content: String) -> Result<()> {
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("content cannot be empty".to_string()));
        }
        let mut inner = self.inner.lock().await;
        self.append_message(&mut inner, task_id, content).await
    }

    /// Apply an event reported by `worker_id` for `task_id`.
    pub async fn on_worker_event(
        &self,
        worker_id: &str,
        task_id: Uuid,
        update: TaskUpdate,
    ) -> Result<EventOutcome> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        if task.worker_id != worker_id {
            warn!(
                "Worker {} reported on task {} owned by {}, discarding",
                worker_id, task_id, task.worker_id
            );
            return Ok(EventOutcome::Discarded);
        }

        let event = match task.apply(update) {
            Ok(event) => event.clone(),
            Err(err) => {
                warn!("Discarding late event: {}", err);
                return Ok(EventOutcome::Discarded);
            }
        };
        self.publish(task, &event);

        if task.status.is_terminal() {
            info!("Task {} finished as {}", task_id, task.status.as_str());
            let snapshot = task.clone();
            inner.release_conversation(&snapshot);
            return Ok(EventOutcome::Finished(snapshot));
        }
        Ok(EventOutcome::Applied)
    }

    /// Cancel a task.
    ///
    /// Sends `task:stop` and marks the task `stopped` right away, without
    /// waiting for the worker to acknowledge. A worker that already went
    /// away does not prevent the stop.
    pub async fn stop(&self, task_id: Uuid) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "task {} is already {}",
                task_id,
                task.status.as_str()
            )));
        }

        match self.connections.resolve(&task.worker_id).await {
            Some(handle) => {
                if let Err(err) = handle.send(GatewayFrame::TaskStop { task_id }) {
                    warn!("Failed to send stop for task {}: {}", task_id, err);
                }
            }
            None => warn!(
                "Worker {} for task {} is gone, stopping locally",
                task.worker_id, task_id
            ),
        }

        let event = task
            .apply(TaskUpdate::Stopped)
            .map_err(|err| Error::Conflict(err.to_string()))?
            .clone();
        self.publish(task, &event);
        info!("Task {} stopped", task_id);

        let snapshot = task.clone();
        inner.release_conversation(&snapshot);
        Ok(snapshot)
    }

    /// Fail every non-terminal task owned by `worker_id`.
    pub async fn fail_worker_tasks(&self, worker_id: &str, reason: &str) -> Vec<Uuid> {
        let mut inner = self.inner.lock().await;
        let mut failed = Vec::new();

        for task in inner.tasks.values_mut() {
            if task.worker_id != worker_id || task.status.is_terminal() {
                continue;
            }
            if let Ok(event) = task.apply(TaskUpdate::Error {
                message: reason.to_string(),
            }) {
                let event = event.clone();
                self.publish(task, &event);
                failed.push(task.id);
            }
        }

        for task_id in &failed {
            if let Some(task) = inner.tasks.get(task_id).cloned() {
                inner.release_conversation(&task);
            }
        }

        if !failed.is_empty() {
            warn!(
                "Failed {} task(s) of worker {}: {}",
                failed.len(),
                worker_id,
                reason
            );
        }
        failed
    }

    /// Snapshot of one task.
    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.inner.lock().await.tasks.get(&task_id).cloned()
    }

    /// Snapshots of all tasks in creation order.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect()
    }

    /// The non-terminal task for a conversation, if any.
    #[cfg(test)]
    pub async fn active_task_for(&self, conversation_id: &str) -> Option<Uuid> {
        self.inner
            .lock()
            .await
            .active_by_conversation
            .get(conversation_id)
            .copied()
    }

    /// Ids of the non-terminal tasks each worker owns.
    pub async fn active_tasks_by_worker(&self) -> HashMap<String, Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let mut by_worker: HashMap<String, Vec<Uuid>> = HashMap::new();
        for id in &inner.order {
            if let Some(task) = inner.tasks.get(id).filter(|t| t.is_active()) {
                by_worker.entry(task.worker_id.clone()).or_default().push(task.id);
            }
        }
        by_worker
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.is_active())
            .count()
    }

    fn publish(&self, task: &Task, event: &TaskEvent) {
        let stream_event = StreamEvent::from_task_event(task.id, task.status, event);
        self.hub.publish(&task.id.to_string(), &stream_event);
        if let Some(conversation_id) = &task.conversation_id {
            self.hub.publish(conversation_id, &stream_event);
        }
    }
}
