//! Task lifecycle states and the `tasks/*` wire payloads.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::McpError;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Initial state; the producer is running.
    Working,
    /// The producer is paused waiting for caller input.
    #[serde(alias = "input-required")]
    InputRequired,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Canceled by a caller or by manager shutdown.
    #[serde(alias = "cancelled")]
    Canceled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Working,
        TaskStatus::InputRequired,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::InputRequired => "input_required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Working, Completed | Failed | Canceled | InputRequired)
                | (InputRequired, Working | Canceled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a task, published once on its completion signal.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed { message: String, tool_error: bool },
    Canceled,
}

impl TaskOutcome {
    /// Status the outcome corresponds to.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::Canceled => TaskStatus::Canceled,
        }
    }

    /// Turn the outcome into what a waiter receives.
    pub fn into_result(self, id: &str) -> crate::Result<Value> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed {
                message,
                tool_error,
            } => Err(McpError::TaskFailed {
                id: id.to_string(),
                message,
                tool_error,
            }),
            Self::Canceled => Err(McpError::TaskCanceled(id.to_string())),
        }
    }
}

/// Task metadata as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Time to live, in milliseconds.
    pub ttl: u64,
    /// Suggested polling interval, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

/// Full view of a task held by the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub status_message: Option<String>,
    /// Method that created the task.
    pub method: String,
    pub params: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub working: usize,
    pub input_required: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl TaskStats {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Working => self.working += 1,
            TaskStatus::InputRequired => self.input_required += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Canceled => self.canceled += 1,
        }
    }
}

/// `task` field of a task-augmented `tools/call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Requested time to live, in milliseconds.
    #[serde(default)]
    pub ttl: u64,
}

impl TaskRequest {
    pub fn from_duration(ttl: Duration) -> Self {
        Self {
            ttl: duration_millis(ttl),
        }
    }

    /// Requested TTL, or `None` when the server default applies.
    pub fn requested_ttl(&self) -> Option<Duration> {
        (self.ttl > 0).then(|| Duration::from_millis(self.ttl))
    }
}

/// Params of `tasks/get`, `tasks/result` and `tasks/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    pub task_id: String,
}

/// Params of `tasks/list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Result of `tasks/get` and `tasks/cancel`, and of a task-augmented `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: TaskMetadata,
}

/// Result of `tasks/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResult {
    pub tasks: Vec<TaskMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
