//! Worker pools pulling tasks from durable queues.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use tributary_context::Context;
use tributary_events::PayloadEnvelope;
use tributary_queue::NackOutcome;
use tributary_queue::Queue;
use tributary_queue::QueueMessage;

use crate::backoff::Backoff;
use crate::conf::WorkersConf;
use crate::error::NoHandlerRegistered;
use crate::handler::HandlerRegistry;
use crate::handler::ProgressReporter;
use crate::task::TaskEnvelope;
use crate::tracker::TaskTracker;

/// Pool of workers consuming one queue.
///
/// Each worker loops over dequeue, handler dispatch and ack/nack. Workers
/// share no mutable state with each other; the shared concurrency bound is
/// taken before each handler invocation.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers over the given queue.
    pub fn start(
        context: &Context,
        queue: Queue,
        registry: HandlerRegistry,
        tracker: TaskTracker,
        semaphore: Arc<Semaphore>,
        conf: &WorkersConf,
        count: usize,
    ) -> WorkerPool {
        let (shutdown, _) = watch::channel(false);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let context = context.derive_with(|builder| {
                builder.log_values(slog::o!(
                    "queue" => queue.conf().name.clone(),
                    "worker" => index,
                ))
            });
            let worker = Worker {
                backoff: Backoff::new(&conf.backoff),
                dequeue_timeout: Duration::from_millis(conf.dequeue_timeout_ms),
                queue: queue.clone(),
                registry: registry.clone(),
                semaphore: Arc::clone(&semaphore),
                shutdown: shutdown.subscribe(),
                task_timeout: Duration::from_secs(conf.task_timeout_secs),
                tracker: tracker.clone(),
            };
            workers.push(tokio::spawn(worker.run(context)));
        }
        WorkerPool { shutdown, workers }
    }

    /// Signal the workers to stop and wait for them, up to a deadline.
    pub async fn stop(self, context: &Context, deadline: Duration) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if tokio::time::timeout(deadline, worker).await.is_err() {
                slog::warn!(context.logger, "Worker did not stop within the deadline");
            }
        }
    }
}

struct Worker {
    backoff: Backoff,
    dequeue_timeout: Duration,
    queue: Queue,
    registry: HandlerRegistry,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    task_timeout: Duration,
    tracker: TaskTracker,
}

impl Worker {
    async fn run(mut self, context: Context) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let message = tokio::select! {
                _ = self.shutdown.changed() => break,
                message = self.queue.dequeue(&context, self.dequeue_timeout) => message,
            };
            let message = match message {
                Ok(None) => continue,
                Ok(Some(message)) => {
                    self.backoff.success();
                    message
                }
                Err(error) => {
                    // Store errors are usually transient; back off and retry.
                    // Exhausting the budget stops this worker.
                    if let Err(error) = self.backoff.retry(&context, error).await {
                        slog::error!(
                            context.logger, "Worker stopping, task store unavailable";
                            "error" => %error,
                        );
                        break;
                    }
                    continue;
                }
            };
            if let Err(error) = self.process(&context, message).await {
                slog::error!(
                    context.logger, "Worker failed to settle a message";
                    "error" => %error,
                );
            }
        }
    }

    /// Decode, dispatch and settle one message.
    async fn process(&self, context: &Context, message: QueueMessage) -> Result<()> {
        let envelope: Result<TaskEnvelope> =
            PayloadEnvelope::decode(&message.payload).and_then(|wrapped| wrapped.open());
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(error) => {
                // Poison payloads go straight to the dead letter set.
                slog::warn!(
                    context.logger, "Discarding undecodable task payload";
                    "message" => &message.id, "error" => %error,
                );
                crate::telemetry::DECODE_ERR
                    .with_label_values(&[&self.queue.conf().name])
                    .inc();
                self.queue.nack(context, &message.id, false).await?;
                return Ok(());
            }
        };
        let context = context.derive_with(|builder| {
            builder.log_values(slog::o!("task_id" => envelope.task_id.clone()))
        });
        let task_type = envelope.task_type;

        if self.tracker.is_revoked(&envelope.task_id) {
            self.tracker.retire_revoked(&envelope.task_id);
            self.queue.ack(&context, &message.id).await?;
            slog::debug!(context.logger, "Skipped revoked task");
            return Ok(());
        }

        let handler = match self.registry.get(task_type) {
            Some(handler) => handler,
            None => {
                // Without a handler retries cannot help.
                let error = NoHandlerRegistered::new(task_type.as_str());
                self.tracker.fail(&envelope.task_id, error.to_string());
                crate::telemetry::EXECUTE_COUNT
                    .with_label_values(&[task_type.as_str(), "no_handler"])
                    .inc();
                self.queue.nack(&context, &message.id, false).await?;
                return Ok(());
            }
        };

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("task concurrency bound closed"))?;
        self.tracker.mark_started(&envelope.task_id);
        let progress = ProgressReporter::new(envelope.task_id.clone(), self.tracker.clone());
        let result = tokio::time::timeout(
            self.task_timeout,
            handler.execute(&context, &envelope, progress),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("task execution timed out")));
        match result {
            Ok(value) => {
                self.tracker.complete(&envelope.task_id, value);
                crate::telemetry::EXECUTE_COUNT
                    .with_label_values(&[task_type.as_str(), "success"])
                    .inc();
                self.queue.ack(&context, &message.id).await?;
            }
            Err(error) => {
                slog::warn!(
                    context.logger, "Task handler failed";
                    "task_type" => task_type.as_str(), "error" => %error,
                );
                crate::telemetry::EXECUTE_COUNT
                    .with_label_values(&[task_type.as_str(), "failure"])
                    .inc();
                let outcome = self.queue.nack(&context, &message.id, true).await?;
                match outcome {
                    NackOutcome::Retrying { .. } => self.tracker.mark_retry(&envelope.task_id),
                    _ => self.tracker.fail(&envelope.task_id, error.to_string()),
                }
            }
        }
        Ok(())
    }
}
