//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour beyond
//! the status enums' terminal/claimable predicates.  The workflow graph
//! itself lives in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// A status column held a value no enum variant matches.
#[derive(Debug, Clone, Error)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(pub String);

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted, immutable workflow version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Monotonic per `name`.
    pub version: i32,
    /// JSON definition: `{ "nodes": [...], "edges": [...] }`.
    pub definition: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// Possible statuses for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ParseStatusError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"  => Ok(Self::Pending),
            "RUNNING"  => Ok(Self::Running),
            "SUCCESS"  => Ok(Self::Success),
            "FAILED"   => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other      => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl TryFrom<String> for RunStatus {
    type Error = ParseStatusError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A persisted run row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new run (always created `PENDING`).
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub input: serde_json::Value,
    pub created_by: Option<String>,
}

/// Target of a compare-and-swap run status update.
#[derive(Debug, Clone)]
pub struct RunTransition {
    pub status: RunStatus,
    pub output: Option<serde_json::Value>,
}

impl RunTransition {
    pub fn to(status: RunStatus) -> Self {
        Self { status, output: None }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// `started_at` is stamped when entering RUNNING.
    pub fn stamps_start(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// `completed_at` is stamped when entering a terminal status.
    pub fn stamps_completion(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// tasks
// ---------------------------------------------------------------------------

/// Possible statuses for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Retry,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending  => "PENDING",
            Self::Running  => "RUNNING",
            Self::Success  => "SUCCESS",
            Self::Failed   => "FAILED",
            Self::Retry    => "RETRY",
            Self::Canceled => "CANCELED",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Statuses a dispatcher may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Retry)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ParseStatusError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"  => Ok(Self::Pending),
            "RUNNING"  => Ok(Self::Running),
            "SUCCESS"  => Ok(Self::Success),
            "FAILED"   => Ok(Self::Failed),
            "RETRY"    => Ok(Self::Retry),
            "CANCELED" => Ok(Self::Canceled),
            other      => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = ParseStatusError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A persisted task row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub idempotency_key: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unique key that makes task creation exactly-once per (run, node).
pub fn idempotency_key(run_id: Uuid, node_id: &str) -> String {
    format!("{run_id}-{node_id}")
}

/// Insert payload for a new task (always created `PENDING`).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub input: serde_json::Value,
    pub max_retries: i32,
}

impl NewTask {
    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.run_id, &self.node_id)
    }
}

/// Result applied to a `RUNNING` task.
#[derive(Debug, Clone)]
pub enum TaskTransition {
    Succeeded { output: serde_json::Value },
    Retrying { error: String, retry_count: i32 },
    Failed { error: String },
}

impl TaskTransition {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Succeeded { .. } => TaskStatus::Success,
            Self::Retrying { .. } => TaskStatus::Retry,
            Self::Failed { .. } => TaskStatus::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// task_logs
// ---------------------------------------------------------------------------

/// Severity of a task log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info  => "INFO",
            Self::Warn  => "WARN",
            Self::Error => "ERROR",
        }
    }

    /// Lenient parse used for handler-reported levels; unknown values map to INFO.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted task log line.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskLogRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub level: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl NewTaskLog {
    pub fn new(task: &TaskRow, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            task_id: task.id,
            run_id: task.run_id,
            level,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// dead_letters
// ---------------------------------------------------------------------------

/// A task that failed for good.  Diagnostic only, never replayed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetterRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub input: serde_json::Value,
    pub error: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub input: serde_json::Value,
    pub error: String,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl NewDeadLetter {
    /// Capture a failed task together with its last error.
    pub fn from_task(task: &TaskRow, error: impl Into<String>) -> Self {
        Self {
            run_id: task.run_id,
            workflow_id: task.workflow_id,
            node_id: task.node_id.clone(),
            input: task.input.clone(),
            error: error.into(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
        }
    }
}
