//! Store backends implementing the durable queue structures.
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use crate::message::QueueMessage;
use crate::queue::QueueSizes;

mod redis;

#[cfg(any(test, feature = "test-fixture"))]
mod memory;

pub use self::redis::RedisBackend;

#[cfg(any(test, feature = "test-fixture"))]
pub use self::memory::MemoryBackend;

/// Operations a store must implement to back a durable queue.
///
/// Backends own placement (primary structure, delayed set, processing set,
/// dead letter set) and the persisted statistics counters; delivery policy
/// (expiry gating, retry/backoff decisions, status transitions) lives in
/// [`Queue`](crate::Queue) so it is identical across backends.
#[async_trait::async_trait]
pub trait QueueBackend: Send + Sync {
    /// Durably record a message and place it for delivery.
    ///
    /// Placement is the delayed set when `delay_until` is set, the primary
    /// structure otherwise. The record must be durable before this returns.
    async fn put(&self, message: &QueueMessage) -> Result<()>;

    /// Attempt to deliver one message.
    ///
    /// In one atomic step against the store: return expired leases to the
    /// primary structure, migrate due delayed messages, pop the next message
    /// per the queue mode and insert it into the processing set with a fresh
    /// lease. The returned message is already marked as processing.
    async fn take(&self) -> Result<Option<QueueMessage>>;

    /// Fetch the record for a message, if it still exists.
    async fn load(&self, id: &str) -> Result<Option<QueueMessage>>;

    /// Persist an updated message record.
    async fn update(&self, message: &QueueMessage) -> Result<()>;

    /// Remove a message from the processing set and mark it completed.
    ///
    /// Unknown messages are treated as already acknowledged.
    async fn ack(&self, id: &str) -> Result<()>;

    /// Move a message from the processing set to the delayed set for
    /// redelivery at `delay_until`.
    async fn requeue(&self, message: &QueueMessage, delay_until: DateTime<Utc>) -> Result<()>;

    /// Move a message from the processing set to the dead letter set.
    async fn reject(&self, message: &QueueMessage) -> Result<()>;

    /// Remove a message from the processing set and mark it expired.
    async fn mark_expired(&self, message: &QueueMessage) -> Result<()>;

    /// Persisted monotonic counters for this queue.
    async fn counters(&self) -> Result<QueueCounters>;

    /// Current sizes of the queue structures.
    async fn sizes(&self) -> Result<QueueSizes>;

    /// Remove all messages from the primary, delayed and dead letter
    /// structures, and their records.
    ///
    /// The processing set is intentionally left alone: leased messages
    /// drain through ack/nack or lease expiry.
    async fn purge(&self) -> Result<u64>;
}

/// Monotonic counters persisted with the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub expired: u64,
}
