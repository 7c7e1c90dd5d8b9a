//! Configuration for the task manager, workers and broker backend.
use serde::Deserialize;
use serde::Serialize;

use crate::task::BackendKind;

/// Backoff applied when interactions with the task store fail.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConf {
    /// Maximum time, in seconds, to wait between retries.
    #[serde(default = "BackoffConf::default_max_delay")]
    pub max_delay: u64,

    /// Retries before store errors fail the worker loop.
    #[serde(default = "BackoffConf::default_max_retries")]
    pub max_retries: u16,

    /// Delay multiplier applied after every consecutive error.
    #[serde(default = "BackoffConf::default_multiplier")]
    pub multiplier: u32,

    /// Initial delay, in milliseconds, before the first retry.
    #[serde(default = "BackoffConf::default_start_delay")]
    pub start_delay: u64,
}

impl Default for BackoffConf {
    fn default() -> Self {
        BackoffConf {
            max_delay: BackoffConf::default_max_delay(),
            max_retries: BackoffConf::default_max_retries(),
            multiplier: BackoffConf::default_multiplier(),
            start_delay: BackoffConf::default_start_delay(),
        }
    }
}

impl BackoffConf {
    fn default_max_delay() -> u64 {
        30
    }

    fn default_max_retries() -> u16 {
        10
    }

    fn default_multiplier() -> u32 {
        2
    }

    fn default_start_delay() -> u64 {
        200
    }
}

/// Configuration for task execution workers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConf {
    /// Backoff applied when interactions with the task store fail.
    #[serde(default)]
    pub backoff: BackoffConf,

    /// Maximum number of tasks executing concurrently across all pools.
    #[serde(default = "WorkersConf::default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Workers pulling from each task queue.
    ///
    /// Sinks that require strict per key ordering should keep this at 1.
    #[serde(default = "WorkersConf::default_workers_per_queue")]
    pub workers_per_queue: usize,

    /// Blocking bound, in milliseconds, for each dequeue attempt.
    #[serde(default = "WorkersConf::default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,

    /// Execution budget, in seconds, for a single handler invocation.
    #[serde(default = "WorkersConf::default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for WorkersConf {
    fn default() -> Self {
        WorkersConf {
            backoff: BackoffConf::default(),
            max_concurrent_tasks: WorkersConf::default_max_concurrent_tasks(),
            workers_per_queue: WorkersConf::default_workers_per_queue(),
            dequeue_timeout_ms: WorkersConf::default_dequeue_timeout_ms(),
            task_timeout_secs: WorkersConf::default_task_timeout_secs(),
        }
    }
}

impl WorkersConf {
    fn default_max_concurrent_tasks() -> usize {
        10
    }

    fn default_workers_per_queue() -> usize {
        1
    }

    fn default_dequeue_timeout_ms() -> u64 {
        1000
    }

    fn default_task_timeout_secs() -> u64 {
        300
    }
}

/// Producer acknowledgement level required from the broker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckLevel {
    /// All in-sync replicas acknowledged the write.
    All,
    /// The partition leader acknowledged the write.
    Leader,
    /// Fire and forget.
    None,
}

impl AckLevel {
    pub fn as_rdkafka_option(&self) -> &'static str {
        match self {
            AckLevel::All => "all",
            AckLevel::Leader => "1",
            AckLevel::None => "0",
        }
    }
}

impl Default for AckLevel {
    fn default() -> AckLevel {
        AckLevel::All
    }
}

/// Configuration for the broker task backend.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConf {
    /// Comma separated list of broker addresses.
    pub brokers: String,

    /// Client ID reported to the broker.
    #[serde(default = "BrokerConf::default_client_id")]
    pub client_id: String,

    /// Prefix for task topics; tasks publish to `{prefix}.{task_type}`.
    #[serde(default = "BrokerConf::default_topic_prefix")]
    pub topic_prefix: String,

    /// Request timeout, in milliseconds, for produce operations.
    #[serde(default = "BrokerConf::default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Producer acknowledgement level required from the broker.
    #[serde(default)]
    pub ack_level: AckLevel,
}

impl BrokerConf {
    fn default_client_id() -> String {
        "tributary:tasks".into()
    }

    fn default_topic_prefix() -> String {
        "tributary.tasks".into()
    }

    fn default_request_timeout_ms() -> u64 {
        5000
    }
}

/// Configuration handed to [`TaskManager::new`](crate::TaskManager::new).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskManagerConf {
    /// Backend tasks are submitted to unless the submission overrides it.
    #[serde(default = "TaskManagerConf::default_backend")]
    pub default_backend: BackendKind,

    /// Worker pools configuration.
    #[serde(default)]
    pub workers: WorkersConf,

    /// Broker backend configuration; the broker backend is disabled
    /// when absent.
    #[serde(default)]
    pub broker: Option<BrokerConf>,

    /// Horizon, in hours, past which completed task records are pruned.
    #[serde(default = "TaskManagerConf::default_result_retention_hours")]
    pub result_retention_hours: u64,
}

impl Default for TaskManagerConf {
    fn default() -> Self {
        TaskManagerConf {
            default_backend: TaskManagerConf::default_backend(),
            workers: WorkersConf::default(),
            broker: None,
            result_retention_hours: TaskManagerConf::default_result_retention_hours(),
        }
    }
}

impl TaskManagerConf {
    fn default_backend() -> BackendKind {
        BackendKind::Queue
    }

    fn default_result_retention_hours() -> u64 {
        24
    }
}
