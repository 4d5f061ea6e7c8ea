//! Task model definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// Kind of entry in a task's event history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Submitted,
    Started,
    Progress,
    Message,
    Completed,
    Error,
    Stopped,
}

/// One entry in a task's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// 1-based, contiguous within a task.
    pub seq: u64,
    pub kind: TaskEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A change reported against a task, usually by its worker.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Started,
    Progress {
        content: Option<String>,
        data: serde_json::Value,
    },
    /// Follow-up instruction appended to an active task.
    Message { content: String },
    Completed { result: String },
    Error { message: String },
    Stopped,
}

impl TaskUpdate {
    fn kind(&self) -> TaskEventKind {
        match self {
            Self::Started => TaskEventKind::Started,
            Self::Progress { .. } => TaskEventKind::Progress,
            Self::Message { .. } => TaskEventKind::Message,
            Self::Completed { .. } => TaskEventKind::Completed,
            Self::Error { .. } => TaskEventKind::Error,
            Self::Stopped => TaskEventKind::Stopped,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task {task_id} is already {status:?}")]
pub struct TerminalTaskError {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

/// A unit of work assigned to one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub worker_id: String,
    pub goal: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

impl Task {
    /// Create a pending task assigned to `worker_id`
    pub fn new(goal: impl Into<String>, worker_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let goal = goal.into();
        let mut task = Self {
            id: Uuid::new_v4(),
            worker_id: worker_id.into(),
            goal: goal.clone(),
            status: TaskStatus::default(),
            channel_id: None,
            conversation_id: None,
            created_at: now,
            updated_at: now,
            result: None,
            error_message: None,
            events: Vec::new(),
        };
        task.push_event(TaskEventKind::Submitted, Some(goal), serde_json::Value::Null);
        task
    }

    /// Bind the task to the conversation it was created from
    pub fn with_conversation(
        mut self,
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        self.channel_id = Some(channel_id.into());
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Apply an update and return the event it appended.
    ///
    /// Terminal tasks reject every update; nothing is appended in that case.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<&TaskEvent, TerminalTaskError> {
        if self.status.is_terminal() {
            return Err(TerminalTaskError {
                task_id: self.id,
                status: self.status,
            });
        }

        let kind = update.kind();
        let (content, data) = match update {
            TaskUpdate::Started => {
                self.status = TaskStatus::Running;
                (None, serde_json::Value::Null)
            }
            TaskUpdate::Progress { content, data } => (content, data),
            TaskUpdate::Message { content } => (Some(content), serde_json::Value::Null),
            TaskUpdate::Completed { result } => {
                self.status = TaskStatus::Completed;
                self.result = Some(result.clone());
                (Some(result), serde_json::Value::Null)
            }
            TaskUpdate::Error { message } => {
                self.status = TaskStatus::Error;
                self.error_message = Some(message.clone());
                (Some(message), serde_json::Value::Null)
            }
            TaskUpdate::Stopped => {
                self.status = TaskStatus::Stopped;
                (None, serde_json::Value::Null)
            }
        };

        Ok(self.push_event(kind, content, data))
    }

    fn push_event(
        &mut self,
        kind: TaskEventKind,
        content: Option<String>,
        data: serde_json::Value,
    ) -> &TaskEvent {
        let now = Utc::now();
        self.updated_at = now;
        self.events.push(TaskEvent {
            seq: self.events.len() as u64 + 1,
            kind,
            content,
            data,
            timestamp: now,
        });
        &self.events[self.events.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_task() {
        let task = Task::new("check status", "worker-1");
        assert_eq!(task.goal, "check status");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.conversation_id.is_none());
        assert_eq!(task.events.len(), 1);
        assert_eq!(task.events[0].kind, TaskEventKind::Submitted);
        assert_eq!(task.events[0].seq, 1);
    }

    #[test]
    fn test_lifecycle_to_completed() {
        let mut task = Task::new("check status", "worker-1");
        task.apply(TaskUpdate::Started).unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        task.apply(TaskUpdate::Progress {
            content: Some("halfway".to_string()),
            data: serde_json::Value::Null,
        })
        .unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let event = task
            .apply(TaskUpdate::Completed {
                result: "all green".to_string(),
            })
            .unwrap();
        assert_eq!(event.seq, 4);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("all green"));
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut task = Task::new("goal", "worker-1");
        task.apply(TaskUpdate::Error {
            message: "boom".to_string(),
        })
        .unwrap();

        let err = task
            .apply(TaskUpdate::Completed {
                result: "late".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.status, TaskStatus::Error);
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.result.is_none());
        assert_eq!(task.events.len(), 2);
    }

    #[test]
    fn test_event_sequence_is_contiguous() {
        let mut task = Task::new("goal", "worker-1");
        for i in 0..5 {
            task.apply(TaskUpdate::Progress {
                content: Some(format!("step {}", i)),
                data: serde_json::Value::Null,
            })
            .unwrap();
        }
        let seqs: Vec<u64> = task.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert!(TaskStatus::Stopped.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
