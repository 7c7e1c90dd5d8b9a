//! Handle to a single durable queue.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use tributary_context::Context;

use crate::backend::QueueBackend;
use crate::config::QueueConf;
use crate::message::retry_backoff;
use crate::message::EnqueueOptions;
use crate::message::MessageStatus;
use crate::message::QueueMessage;

/// Handle to a single durable queue.
///
/// Cheap to clone; clones share the backend connection.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn QueueBackend>,
    conf: Arc<QueueConf>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("conf", &self.conf).finish()
    }
}

impl Queue {
    pub(crate) fn new(conf: QueueConf, backend: Arc<dyn QueueBackend>) -> Queue {
        Queue {
            backend,
            conf: Arc::new(conf),
        }
    }

    /// Queue definition this handle operates on.
    pub fn conf(&self) -> &QueueConf {
        &self.conf
    }

    /// Durably record a message for delivery and return its ID.
    ///
    /// The message is recorded before this returns; store unavailability is
    /// the only failure mode, messages are never silently dropped.
    pub async fn enqueue(
        &self,
        context: &Context,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<String> {
        let now = Utc::now();
        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let delay_until = options
            .delay
            .map(|delay| now + chrono::Duration::from_std(delay).unwrap_or_default());
        let expires_at = options
            .expires_in
            .map(|expiry| now + chrono::Duration::from_std(expiry).unwrap_or_default());
        let message = QueueMessage {
            id: id.clone(),
            queue_name: self.conf.name.clone(),
            payload,
            priority: options.priority,
            delay_until,
            expires_at,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.conf.max_retries),
            created_at: now,
            status: MessageStatus::Pending,
        };
        self.observe("enqueue", self.backend.put(&message)).await?;
        slog::debug!(
            context.logger, "Enqueued message";
            "queue" => &self.conf.name, "message" => &id,
        );
        Ok(id)
    }

    /// Deliver at most one message, waiting up to `timeout` for one to
    /// become available.
    ///
    /// Due delayed messages migrate to the primary structure before each
    /// attempt and expired leases return to it; messages past their expiry
    /// are marked expired without delivery. A zero timeout performs exactly
    /// one attempt.
    pub async fn dequeue(
        &self,
        context: &Context,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(self.conf.poll_interval_ms);
        loop {
            let taken = self.observe("dequeue", self.backend.take()).await?;
            if let Some(message) = taken {
                if message.is_expired(Utc::now()) {
                    self.observe("expire", self.backend.mark_expired(&message))
                        .await?;
                    crate::telemetry::EXPIRED_COUNT
                        .with_label_values(&[&self.conf.name])
                        .inc();
                    slog::debug!(
                        context.logger, "Message expired before delivery";
                        "queue" => &self.conf.name, "message" => &message.id,
                    );
                    continue;
                }
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    /// Acknowledge a message as handled.
    ///
    /// Idempotent: unknown IDs are treated as already acknowledged.
    pub async fn ack(&self, context: &Context, id: &str) -> Result<()> {
        self.observe("ack", self.backend.ack(id)).await?;
        slog::debug!(
            context.logger, "Acknowledged message";
            "queue" => &self.conf.name, "message" => id,
        );
        Ok(())
    }

    /// Report a message as failed and apply the retry policy.
    ///
    /// With retries remaining (and `requeue` set) the message moves to the
    /// delayed set with exponential backoff; otherwise it moves to the dead
    /// letter set. Repeating a nack for an already dead lettered message is
    /// a no-op.
    pub async fn nack(&self, context: &Context, id: &str, requeue: bool) -> Result<NackOutcome> {
        let message = self.observe("nack", self.backend.load(id)).await?;
        let mut message = match message {
            None => return Ok(NackOutcome::Unknown),
            Some(message) if message.status == MessageStatus::Failed => {
                return Ok(NackOutcome::DeadLettered);
            }
            Some(message) => message,
        };

        if requeue && message.retry_count < message.max_retries {
            message.retry_count += 1;
            message.status = MessageStatus::Retrying;
            let backoff = retry_backoff(message.retry_count);
            let delay_until = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
            self.observe("nack", self.backend.requeue(&message, delay_until))
                .await?;
            slog::info!(
                context.logger, "Scheduled message redelivery";
                "queue" => &self.conf.name,
                "message" => id,
                "retry" => message.retry_count,
                "delay_secs" => backoff.as_secs(),
            );
            return Ok(NackOutcome::Retrying { delay: backoff });
        }

        message.status = MessageStatus::Failed;
        self.observe("nack", self.backend.reject(&message)).await?;
        slog::warn!(
            context.logger, "Message moved to the dead letter set";
            "queue" => &self.conf.name,
            "message" => id,
            "retries" => message.retry_count,
        );
        Ok(NackOutcome::DeadLettered)
    }

    /// Counters and structure sizes for this queue.
    pub async fn stats(&self, _: &Context) -> Result<QueueStats> {
        let counters = self.backend.counters().await?;
        let sizes = self.backend.sizes().await?;
        Ok(QueueStats {
            enqueued: counters.enqueued,
            dequeued: counters.dequeued,
            completed: counters.completed,
            failed: counters.failed,
            retried: counters.retried,
            expired: counters.expired,
            primary_size: sizes.primary_size,
            processing_size: sizes.processing_size,
            delayed_size: sizes.delayed_size,
            dlq_size: sizes.dlq_size,
        })
    }

    /// Remove all waiting messages from the queue.
    ///
    /// Clears the primary, delayed and dead letter structures and their
    /// message records; the clears are not transactional across structures
    /// so a concurrent enqueue can survive a purge. In-flight leased
    /// messages are left in the processing set until acknowledged or the
    /// lease expires.
    pub async fn purge(&self, context: &Context) -> Result<u64> {
        let removed = self.observe("purge", self.backend.purge()).await?;
        slog::info!(
            context.logger, "Purged queue";
            "queue" => &self.conf.name, "removed" => removed,
        );
        Ok(removed)
    }

    /// Track telemetry around a backend operation.
    async fn observe<T>(
        &self,
        op: &str,
        operation: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        crate::telemetry::OPS_COUNT
            .with_label_values(&[&self.conf.name, op])
            .inc();
        let result = operation.await;
        if result.is_err() {
            crate::telemetry::OPS_ERR
                .with_label_values(&[&self.conf.name, op])
                .inc();
        }
        result
    }
}

/// Disposition applied to a negatively acknowledged message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NackOutcome {
    /// Scheduled for redelivery after the returned backoff.
    Retrying { delay: Duration },
    /// Moved to the dead letter set; no further deliveries.
    DeadLettered,
    /// No record for the message exists (already completed or purged).
    Unknown,
}

/// Counters and gauges describing a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub expired: u64,
    pub primary_size: u64,
    pub processing_size: u64,
    pub delayed_size: u64,
    pub dlq_size: u64,
}

/// Current sizes of the queue structures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSizes {
    pub primary_size: u64,
    pub processing_size: u64,
    pub delayed_size: u64,
    pub dlq_size: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tributary_context::Context;

    use super::NackOutcome;
    use super::Queue;
    use crate::backend::MemoryBackend;
    use crate::config::QueueConf;
    use crate::config::QueueMode;
    use crate::message::EnqueueOptions;
    use crate::message::MessageStatus;

    fn queue(mode: QueueMode) -> Queue {
        let mut conf = QueueConf::new("unit-test", mode);
        conf.poll_interval_ms = 10;
        let backend = Arc::new(MemoryBackend::new(conf.clone()));
        Queue::new(conf, backend)
    }

    fn queue_with(mut conf: QueueConf) -> Queue {
        conf.poll_interval_ms = 10;
        let backend = Arc::new(MemoryBackend::new(conf.clone()));
        Queue::new(conf, backend)
    }

    async fn enqueue(queue: &Queue, context: &Context, payload: &[u8], options: EnqueueOptions) {
        queue
            .enqueue(context, payload.to_vec(), options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fifo_order_and_stats() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        enqueue(&queue, &context, br#"{"x":1}"#, EnqueueOptions::default()).await;
        enqueue(&queue, &context, br#"{"x":2}"#, EnqueueOptions::default()).await;

        let first = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, br#"{"x":1}"#);
        queue.ack(&context, &first.id).await.unwrap();
        let second = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload, br#"{"x":2}"#);
        queue.ack(&context, &second.id).await.unwrap();

        let stats = queue.stats(&context).await.unwrap();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dequeued, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.primary_size, 0);
        assert_eq!(stats.processing_size, 0);
    }

    #[tokio::test]
    async fn lifo_returns_newest_first() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Lifo);
        enqueue(&queue, &context, b"old", EnqueueOptions::default()).await;
        enqueue(&queue, &context, b"new", EnqueueOptions::default()).await;
        let first = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, b"new");
    }

    #[tokio::test]
    async fn priority_order() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Priority);
        for (priority, payload) in [(1, "a"), (9, "b"), (5, "c")] {
            let options = EnqueueOptions {
                priority,
                ..EnqueueOptions::default()
            };
            enqueue(&queue, &context, payload.as_bytes(), options).await;
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            let message = queue
                .dequeue(&context, Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            order.push(String::from_utf8(message.payload.clone()).unwrap());
            queue.ack(&context, &message.id).await.unwrap();
        }
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn priority_ties_break_by_enqueue_order() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Priority);
        for payload in ["first", "second"] {
            let options = EnqueueOptions {
                priority: 5,
                ..EnqueueOptions::default()
            };
            enqueue(&queue, &context, payload.as_bytes(), options).await;
        }
        let message = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, b"first");
    }

    #[tokio::test]
    async fn delayed_messages_gate_until_due() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        let options = EnqueueOptions {
            delay: Some(Duration::from_millis(300)),
            ..EnqueueOptions::default()
        };
        enqueue(&queue, &context, b"later", options).await;

        let early = queue
            .dequeue(&context, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(early.is_none());

        let message = queue
            .dequeue(&context, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, b"later");
        let delivered_at = chrono::Utc::now();
        let elapsed = delivered_at - message.created_at;
        assert!(elapsed >= chrono::Duration::milliseconds(300));
    }

    #[tokio::test]
    async fn dequeue_zero_on_empty_returns_immediately() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        let result = queue.dequeue(&context, Duration::ZERO).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn expired_messages_are_never_delivered() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        let options = EnqueueOptions {
            expires_in: Some(Duration::from_millis(10)),
            ..EnqueueOptions::default()
        };
        enqueue(&queue, &context, b"stale", options).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = queue.dequeue(&context, Duration::ZERO).await.unwrap();
        assert!(result.is_none());
        let stats = queue.stats(&context).await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.dequeued, 0);
    }

    #[tokio::test]
    async fn nack_schedules_backoff_then_dead_letters() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        enqueue(&queue, &context, b"flaky", EnqueueOptions::default()).await;
        let message = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let outcome = queue.nack(&context, &message.id, true).await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Retrying {
                delay: Duration::from_secs(120)
            }
        );
        let stats = queue.stats(&context).await.unwrap();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.delayed_size, 1);

        // Exhaust the remaining retries straight from the record.
        let record = queue.backend.load(&message.id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.status, MessageStatus::Retrying);
        for _ in 0..2 {
            queue.nack(&context, &message.id, true).await.unwrap();
        }
        let outcome = queue.nack(&context, &message.id, true).await.unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        let record = queue.backend.load(&message.id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Failed);
        assert!(record.retry_count <= record.max_retries);
        let stats = queue.stats(&context).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dlq_size, 1);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        enqueue(&queue, &context, b"broken", EnqueueOptions::default()).await;
        let message = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let outcome = queue.nack(&context, &message.id, false).await.unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn nack_is_idempotent_on_dead_lettered() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        enqueue(&queue, &context, b"broken", EnqueueOptions::default()).await;
        let message = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        queue.nack(&context, &message.id, false).await.unwrap();
        let outcome = queue.nack(&context, &message.id, false).await.unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        let stats = queue.stats(&context).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dlq_size, 1);
    }

    #[tokio::test]
    async fn ack_unknown_is_a_noop() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        queue.ack(&context, "no-such-message").await.unwrap();
    }

    #[tokio::test]
    async fn lease_expiry_returns_message_to_queue() {
        let context = Context::fixture();
        let mut conf = QueueConf::new("unit-test", QueueMode::Fifo);
        conf.visibility_timeout = 1;
        let queue = queue_with(conf);
        enqueue(&queue, &context, b"leaked", EnqueueOptions::default()).await;

        let first = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        // Simulated worker crash: no ack. While the lease is live the
        // message stays invisible.
        let hidden = queue.dequeue(&context, Duration::ZERO).await.unwrap();
        assert!(hidden.is_none());

        // Once the lease expires the message is redelivered, exactly once.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let second = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        queue.ack(&context, &second.id).await.unwrap();
        let third = queue.dequeue(&context, Duration::ZERO).await.unwrap();
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn purge_leaves_processing_until_lease_expiry() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        enqueue(&queue, &context, b"in-flight", EnqueueOptions::default()).await;
        enqueue(&queue, &context, b"waiting", EnqueueOptions::default()).await;

        let leased = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let removed = queue.purge(&context).await.unwrap();
        assert_eq!(removed, 1);

        let stats = queue.stats(&context).await.unwrap();
        assert_eq!(stats.primary_size, 0);
        assert_eq!(stats.processing_size, 1);

        // The leased message can still be acknowledged after the purge.
        queue.ack(&context, &leased.id).await.unwrap();
        let stats = queue.stats(&context).await.unwrap();
        assert_eq!(stats.processing_size, 0);
    }

    #[tokio::test]
    async fn payload_round_trip_is_byte_identical() {
        let context = Context::fixture();
        let queue = queue(QueueMode::Fifo);
        let payload = vec![0u8, 159, 146, 150, 255];
        queue
            .enqueue(&context, payload.clone(), EnqueueOptions::default())
            .await
            .unwrap();
        let message = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, payload);
    }
}
