//! Control protocol types for worker and browser communication
//!
//! All frames are JSON objects tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vg_core::task::{TaskEvent, TaskEventKind, TaskStatus};

/// Worker -> Gateway frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerFrame {
    /// Handshake; must be the first frame on a connection.
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "workerId")]
        worker_id: String,
        name: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        platform: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    #[serde(rename = "task:started")]
    TaskStarted {
        #[serde(rename = "taskId")]
        task_id: Uuid,
    },
    #[serde(rename = "task:progress")]
    TaskProgress {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },
    #[serde(rename = "task:completed")]
    TaskCompleted {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        #[serde(default)]
        result: String,
    },
    #[serde(rename = "task:error")]
    TaskError {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        error: String,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        timestamp: u64,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
}

impl WorkerFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskError { .. } => "task:error",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Gateway -> Worker frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Handshake answer.
    #[serde(rename = "registered")]
    Registered {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "task:submit")]
    TaskSubmit {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        goal: String,
        #[serde(
            rename = "conversationId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        conversation_id: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    #[serde(rename = "task:stop")]
    TaskStop {
        #[serde(rename = "taskId")]
        task_id: Uuid,
    },
    #[serde(rename = "task:message")]
    TaskMessage {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        content: String,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

/// Browser-facing event type. `done` and `error` close the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Status,
    Progress,
    Message,
    Done,
    Error,
}

impl StreamEventType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Message => "message",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// Event fanned out to stream subscribers (SSE or WebSocket)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    /// Event not tied to a task, e.g. a reply or a routing failure.
    pub fn conversation(event_type: StreamEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            task_id: None,
            status: None,
            seq: None,
            content: Some(content.into()),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Project a task history entry into a browser event.
    pub fn from_task_event(task_id: Uuid, status: TaskStatus, event: &TaskEvent) -> Self {
        let event_type = match event.kind {
            TaskEventKind::Submitted | TaskEventKind::Started => StreamEventType::Status,
            TaskEventKind::Progress => StreamEventType::Progress,
            TaskEventKind::Message => StreamEventType::Message,
            TaskEventKind::Completed | TaskEventKind::Stopped => StreamEventType::Done,
            TaskEventKind::Error => StreamEventType::Error,
        };
        Self {
            event_type,
            task_id: Some(task_id),
            status: Some(status),
            seq: Some(event.seq),
            content: event.content.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp,
        }
    }
}
