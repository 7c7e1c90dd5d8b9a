//! Definition of queues and their properties.
use serde::Deserialize;
use serde::Serialize;

/// Ordering discipline of a queue, fixed for its lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// First in, first out.
    Fifo,
    /// Last in, first out.
    Lifo,
    /// Highest priority score first.
    Priority,
    /// Ordered log consumed through a consumer group.
    Stream,
}

impl Default for QueueMode {
    fn default() -> QueueMode {
        QueueMode::Fifo
    }
}

/// Definition of a named queue and its delivery properties.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConf {
    /// Identifier of the queue.
    pub name: String,

    /// Ordering discipline, immutable for the queue's lifetime.
    #[serde(default)]
    pub mode: QueueMode,

    /// Retention, in seconds, for message records without an explicit expiry.
    #[serde(default = "QueueConf::default_ttl")]
    pub default_ttl: u64,

    /// Number of redeliveries before a message is dead lettered.
    #[serde(default = "QueueConf::default_max_retries")]
    pub max_retries: u32,

    /// Lease, in seconds, after which an unacknowledged message is
    /// returned to the queue.
    #[serde(default = "QueueConf::default_visibility_timeout")]
    pub visibility_timeout: u64,

    /// Interval, in milliseconds, between store polls while a dequeue
    /// waits for messages.
    #[serde(default = "QueueConf::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl QueueConf {
    /// Queue definition with default delivery properties.
    pub fn new<S: Into<String>>(name: S, mode: QueueMode) -> QueueConf {
        QueueConf {
            name: name.into(),
            mode,
            default_ttl: QueueConf::default_ttl(),
            max_retries: QueueConf::default_max_retries(),
            visibility_timeout: QueueConf::default_visibility_timeout(),
            poll_interval_ms: QueueConf::default_poll_interval_ms(),
        }
    }

    fn default_ttl() -> u64 {
        3600
    }

    fn default_max_retries() -> u32 {
        3
    }

    fn default_visibility_timeout() -> u64 {
        300
    }

    fn default_poll_interval_ms() -> u64 {
        100
    }
}
