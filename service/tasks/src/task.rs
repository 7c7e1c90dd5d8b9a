//! Task model: types, priorities, lifecycle states and the wire envelope.
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Kinds of work derived from change events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DataPull,
    DataPush,
    DataTransform,
    ConflictResolve,
    BatchProcess,
    HealthCheck,
    Cleanup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::DataPull => "data_pull",
            TaskType::DataPush => "data_push",
            TaskType::DataTransform => "data_transform",
            TaskType::ConflictResolve => "conflict_resolve",
            TaskType::BatchProcess => "batch_process",
            TaskType::HealthCheck => "health_check",
            TaskType::Cleanup => "cleanup",
        }
    }

    /// Name of the durable queue carrying tasks of this type.
    pub fn queue_name(&self) -> String {
        format!("{}_queue", self.as_str())
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.as_str())
    }
}

/// Priority levels mapped onto queue priority scores.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Queue score for the priority; higher dequeues earlier.
    pub fn score(&self) -> i64 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 5,
            TaskPriority::High => 8,
            TaskPriority::Critical => 10,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> TaskPriority {
        TaskPriority::Normal
    }
}

/// Lifecycle state of a submitted task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl TaskStatus {
    /// True for states a task can still leave.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Started | TaskStatus::Retry
        )
    }
}

/// Backends a task can be submitted to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The durable queue.
    Queue,
    /// An external broker topic.
    Broker,
    /// The in-process executor.
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            BackendKind::Queue => "queue",
            BackendKind::Broker => "broker",
            BackendKind::Local => "local",
        };
        write!(fmt, "{}", name)
    }
}

/// Wire payload describing a task, carried opaquely by the backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Options attached to a task at submission time.
#[derive(Clone, Debug, Default)]
pub struct SubmitOptions {
    pub priority: TaskPriority,

    /// Backend override; the manager default applies when unset.
    pub backend: Option<BackendKind>,

    /// Hold the task for this long before it becomes eligible to run.
    pub delay: Option<Duration>,

    /// Never execute the task once this long has passed since submission.
    pub expires_in: Option<Duration>,

    /// Redelivery budget override for the queue backend.
    pub max_retries: Option<u32>,

    pub metadata: BTreeMap<String, Value>,
}

/// Everything the manager tracks about a submitted task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub task_type: TaskType,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub priority: TaskPriority,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub metadata: BTreeMap<String, Value>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

impl TaskInfo {
    /// True once the task expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expiry| expiry <= now).unwrap_or(false)
    }
}
