//! Task records and their lifecycle.
//!
//! ```text
//! pending ──> running ──> succeeded
//!    │           │
//!    │           ├──> retrying ──> running ...
//!    │           ├──> pending      (device busy, requeued)
//!    │           └──> failed
//!    └──> failed                   (cancelled before it ran)
//! ```

use chrono::{DateTime, Utc};
use microlab_core::{ErrorClass, LabError, LabResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier handed back by `submit`.
pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Pending)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Classified failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorClass,
    pub message: String,
}

impl From<&LabError> for TaskError {
    fn from(err: &LabError) -> Self {
        Self {
            kind: err.class(),
            message: err.to_string(),
        }
    }
}

/// Persisted form of a task. Only the executor mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub device_id: String,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    pub state: TaskState,
    /// Retries spent on retryable failures.
    pub retries: u32,
    /// Requeues caused by a busy device; not counted against `retries`.
    #[serde(default)]
    pub contention_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(device_id: impl Into<String>, operation: impl Into<String>, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            operation: operation.into(),
            params,
            state: TaskState::Pending,
            retries: 0,
            contention_retries: 0,
            result: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
        }
    }

    /// Move to `next`, refusing edges the lifecycle does not have.
    pub fn transition(&mut self, next: TaskState) -> LabResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(LabError::Storage(format!(
                "task {}: illegal transition {} -> {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn succeed(&mut self, result: Value) -> LabResult<()> {
        self.transition(TaskState::Succeeded)?;
        self.result = Some(result);
        self.error = None;
        self.next_attempt_at = None;
        Ok(())
    }

    pub fn fail(&mut self, error: TaskError) -> LabResult<()> {
        self.transition(TaskState::Failed)?;
        self.error = Some(error);
        self.next_attempt_at = None;
        Ok(())
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from(self)
    }
}

/// What `task_status` reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub device_id: String,
    pub operation: String,
    pub state: TaskState,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl From<&TaskRecord> for TaskStatus {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            device_id: record.device_id.clone(),
            operation: record.operation.clone(),
            state: record.state,
            retries: record.retries,
            result: record.result.clone(),
            error: record.error.clone(),
            cancel_requested: record.cancel_requested,
        }
    }
}
