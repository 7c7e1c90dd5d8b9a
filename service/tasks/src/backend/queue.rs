//! Task backend over the durable queue.
use anyhow::Result;

use tributary_context::Context;
use tributary_events::PayloadEnvelope;
use tributary_queue::EnqueueOptions;
use tributary_queue::QueueConf;
use tributary_queue::QueueManager;
use tributary_queue::QueueMode;

use crate::task::TaskPriority;

use super::TaskBackend;
use super::TaskSubmission;

/// Task backend over the durable queue.
///
/// Each task type flows through its own queue, named `{task_type}_queue`.
/// The queue is created in priority mode when the first submission carries
/// a non default priority, fifo mode otherwise.
pub struct QueueTaskBackend {
    queues: QueueManager,
}

impl QueueTaskBackend {
    pub fn new(queues: QueueManager) -> QueueTaskBackend {
        QueueTaskBackend { queues }
    }
}

#[async_trait::async_trait]
impl TaskBackend for QueueTaskBackend {
    async fn submit(&self, context: &Context, submission: TaskSubmission) -> Result<()> {
        let mode = if submission.priority != TaskPriority::Normal {
            QueueMode::Priority
        } else {
            QueueMode::Fifo
        };
        let conf = QueueConf::new(submission.envelope.task_type.queue_name(), mode);
        let queue = self.queues.create(conf);

        let payload = PayloadEnvelope::wrap(&submission.envelope)?.encode()?;
        let options = EnqueueOptions {
            priority: submission.priority.score(),
            delay: submission.delay,
            expires_in: submission.expires_in,
            max_retries: submission.max_retries,
            // Reusing the task ID keeps queue records traceable to tasks.
            id: Some(submission.envelope.task_id.clone()),
        };
        queue.enqueue(context, payload, options).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tributary_context::Context;
    use tributary_events::PayloadEnvelope;
    use tributary_queue::QueueManager;
    use tributary_queue::QueueMode;

    use super::QueueTaskBackend;
    use super::TaskBackend;
    use super::TaskSubmission;
    use crate::task::TaskEnvelope;
    use crate::task::TaskPriority;
    use crate::task::TaskType;

    fn submission(priority: TaskPriority) -> TaskSubmission {
        TaskSubmission {
            envelope: TaskEnvelope {
                task_id: "task-1".into(),
                task_type: TaskType::DataTransform,
                args: vec![serde_json::json!(1)],
                kwargs: Default::default(),
                metadata: Default::default(),
            },
            priority,
            delay: None,
            expires_in: None,
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn round_trips_envelope_through_queue() {
        let context = Context::fixture();
        let queues = QueueManager::memory();
        let backend = QueueTaskBackend::new(queues.clone());
        backend
            .submit(&context, submission(TaskPriority::Normal))
            .await
            .unwrap();

        let queue = queues.get("data_transform_queue").unwrap();
        assert_eq!(queue.conf().mode, QueueMode::Fifo);
        let message = queue
            .dequeue(&context, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, "task-1");
        let envelope: TaskEnvelope = PayloadEnvelope::decode(&message.payload)
            .unwrap()
            .open()
            .unwrap();
        assert_eq!(envelope.task_id, "task-1");
        assert_eq!(envelope.task_type, TaskType::DataTransform);
    }

    #[tokio::test]
    async fn non_default_priority_selects_priority_mode() {
        let context = Context::fixture();
        let queues = QueueManager::memory();
        let backend = QueueTaskBackend::new(queues.clone());
        backend
            .submit(&context, submission(TaskPriority::High))
            .await
            .unwrap();
        let queue = queues.get("data_transform_queue").unwrap();
        assert_eq!(queue.conf().mode, QueueMode::Priority);
    }
}
