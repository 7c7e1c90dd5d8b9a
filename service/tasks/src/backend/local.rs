//! In-process task backend and its executor loop.
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Semaphore;

use tributary_context::Context;

use crate::error::NoHandlerRegistered;
use crate::handler::HandlerRegistry;
use crate::handler::ProgressReporter;
use crate::tracker::TaskTracker;

use super::TaskBackend;
use super::TaskSubmission;

/// In-process task backend.
///
/// Submissions land on an unbounded channel consumed by a single
/// [`LocalExecutor`]; the executor applies the shared concurrency bound
/// at dispatch.
pub struct LocalTaskBackend {
    sender: mpsc::UnboundedSender<TaskSubmission>,
}

impl LocalTaskBackend {
    /// Create the backend and the receiving half for its executor.
    pub fn channel() -> (LocalTaskBackend, mpsc::UnboundedReceiver<TaskSubmission>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (LocalTaskBackend { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl TaskBackend for LocalTaskBackend {
    async fn submit(&self, _: &Context, submission: TaskSubmission) -> Result<()> {
        self.sender
            .send(submission)
            .map_err(|_| anyhow::anyhow!("local task executor is not running"))?;
        Ok(())
    }
}

/// Dispatch loop executing locally submitted tasks.
pub struct LocalExecutor {
    receiver: mpsc::UnboundedReceiver<TaskSubmission>,
    registry: HandlerRegistry,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    task_timeout: std::time::Duration,
    tracker: TaskTracker,
}

impl LocalExecutor {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<TaskSubmission>,
        registry: HandlerRegistry,
        tracker: TaskTracker,
        semaphore: Arc<Semaphore>,
        task_timeout: std::time::Duration,
        shutdown: watch::Receiver<bool>,
    ) -> LocalExecutor {
        LocalExecutor {
            receiver,
            registry,
            semaphore,
            shutdown,
            task_timeout,
            tracker,
        }
    }

    /// Consume submissions until shutdown is signalled.
    ///
    /// Each submission is dispatched on its own tokio task once a permit
    /// from the shared concurrency bound is available.
    pub async fn run(mut self, context: Context) {
        loop {
            let submission = tokio::select! {
                _ = self.shutdown.changed() => break,
                submission = self.receiver.recv() => match submission {
                    None => break,
                    Some(submission) => submission,
                },
            };
            let context = context.derive_with(|builder| {
                builder.log_values(slog::o!(
                    "task_id" => submission.envelope.task_id.clone(),
                ))
            });
            let registry = self.registry.clone();
            let tracker = self.tracker.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let task_timeout = self.task_timeout;
            tokio::spawn(async move {
                LocalExecutor::dispatch(
                    context,
                    registry,
                    tracker,
                    semaphore,
                    task_timeout,
                    submission,
                )
                .await;
            });
        }
    }

    async fn dispatch(
        context: Context,
        registry: HandlerRegistry,
        tracker: TaskTracker,
        semaphore: Arc<Semaphore>,
        task_timeout: std::time::Duration,
        submission: TaskSubmission,
    ) {
        let task_id = submission.envelope.task_id.clone();
        let task_type = submission.envelope.task_type;

        // Honour the eta before taking a concurrency permit.
        if let Some(delay) = submission.delay {
            tokio::time::sleep(delay).await;
        }
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore only closes on process teardown.
            Err(_) => return,
        };

        if tracker.is_revoked(&task_id) {
            tracker.retire_revoked(&task_id);
            slog::debug!(context.logger, "Skipped revoked task");
            return;
        }
        let expired = tracker
            .expires_at(&task_id)
            .map(|expiry| expiry <= Utc::now())
            .unwrap_or(false);
        if expired {
            tracker.fail(&task_id, "task expired before dispatch".into());
            crate::telemetry::EXECUTE_COUNT
                .with_label_values(&[task_type.as_str(), "expired"])
                .inc();
            return;
        }

        let handler = match registry.get(task_type) {
            Some(handler) => handler,
            None => {
                let error = NoHandlerRegistered::new(task_type.as_str());
                tracker.fail(&task_id, error.to_string());
                crate::telemetry::EXECUTE_COUNT
                    .with_label_values(&[task_type.as_str(), "no_handler"])
                    .inc();
                return;
            }
        };

        tracker.mark_started(&task_id);
        let progress = ProgressReporter::new(task_id.clone(), tracker.clone());
        let result = tokio::time::timeout(
            task_timeout,
            handler.execute(&context, &submission.envelope, progress),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("task execution timed out")));
        match result {
            Ok(value) => {
                tracker.complete(&task_id, value);
                crate::telemetry::EXECUTE_COUNT
                    .with_label_values(&[task_type.as_str(), "success"])
                    .inc();
            }
            Err(error) => {
                slog::warn!(
                    context.logger, "Local task failed";
                    "task_type" => task_type.as_str(), "error" => %error,
                );
                tracker.fail(&task_id, error.to_string());
                crate::telemetry::EXECUTE_COUNT
                    .with_label_values(&[task_type.as_str(), "failure"])
                    .inc();
            }
        }
    }
}
