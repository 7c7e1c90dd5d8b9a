//! Durable multi-mode message queue over an external key-value store.
//!
//! Each named queue is a durable work buffer with a mode fixed at creation:
//!
//! - `fifo`: tail enqueue, head dequeue.
//! - `lifo`: head enqueue, head dequeue.
//! - `priority`: sorted by priority score, dequeue max.
//! - `stream`: ordered log consumed through a consumer group.
//!
//! Every mode carries a *delayed* overlay (messages gated until a wall clock
//! time), a processing set with lease based redelivery, and a dead letter
//! set for messages that exhausted their retries.
//!
//! The store is expected to provide atomic list, sorted set, set, hash and
//! stream primitives plus server side scripting; dequeue uses a single
//! script so migration, lease sweep and pop cannot interleave with other
//! consumers.
mod config;
mod error;
mod manager;
mod message;
mod queue;
mod telemetry;

pub mod backend;

pub use self::config::QueueConf;
pub use self::config::QueueMode;
pub use self::error::MessageDecode;
pub use self::error::UnknownQueue;
pub use self::manager::QueueManager;
pub use self::message::retry_backoff;
pub use self::message::EnqueueOptions;
pub use self::message::MessageStatus;
pub use self::message::QueueMessage;
pub use self::queue::NackOutcome;
pub use self::queue::Queue;
pub use self::queue::QueueSizes;
pub use self::queue::QueueStats;
pub use self::telemetry::register_metrics;
