//! Default task handlers registered by the coordinator.
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use serde_json::Value;

use tributary_context::Context;
use tributary_events::checkpoint::Checkpoints;
use tributary_events::checkpoint::SourcePosition;
use tributary_events::ChangeEvent;
use tributary_tasks::ProgressReporter;
use tributary_tasks::ProgressUpdate;
use tributary_tasks::TaskEnvelope;
use tributary_tasks::TaskHandler;

/// Transforms change events into their normalized downstream form and
/// advances the source checkpoint once handling is durable.
pub struct DataTransformHandler {
    checkpoints: Checkpoints,
}

impl DataTransformHandler {
    pub fn new(checkpoints: Checkpoints) -> DataTransformHandler {
        DataTransformHandler { checkpoints }
    }
}

#[async_trait::async_trait]
impl TaskHandler for DataTransformHandler {
    async fn execute(
        &self,
        context: &Context,
        task: &TaskEnvelope,
        progress: ProgressReporter,
    ) -> Result<Value> {
        let event = task
            .kwargs
            .get("event")
            .ok_or_else(|| anyhow::anyhow!("data transform task carries no change event"))?;
        let event: ChangeEvent = serde_json::from_value(event.clone())?;
        progress.update(ProgressUpdate {
            current_step: Some(1),
            total_steps: Some(2),
            message: Some("transforming".into()),
            ..ProgressUpdate::default()
        });

        // The normalized row is the after image for inserts/updates and
        // the before image for deletes.
        let row = event.after.as_ref().or(event.before.as_ref());
        let transformed = json!({
            "event_id": event.id,
            "table": event.table,
            "operation": event.operation,
            "row": row,
            "synthetic": event.is_synthetic(),
        });

        // Checkpoint only after the transform is durably handled; a crash
        // before this point redelivers the message.
        let source_id = event
            .metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let position = SourcePosition {
            source_id,
            last_committed_cursor: event.position.clone(),
            last_event_time: event.timestamp,
            last_event_id: event.id.clone(),
        };
        self.checkpoints.save(context, &position).await?;
        progress.update(ProgressUpdate {
            current_step: Some(2),
            total_steps: Some(2),
            message: Some("checkpointed".into()),
            ..ProgressUpdate::default()
        });
        Ok(transformed)
    }
}

/// Processes a batch of items, reporting progress per chunk.
pub struct BatchProcessHandler {
    batch_size: usize,
}

impl BatchProcessHandler {
    pub fn new(batch_size: usize) -> BatchProcessHandler {
        BatchProcessHandler {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for BatchProcessHandler {
    async fn execute(
        &self,
        _: &Context,
        task: &TaskEnvelope,
        progress: ProgressReporter,
    ) -> Result<Value> {
        let items = task
            .kwargs
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = items.len();
        let mut processed = 0u64;
        let mut failed = 0u64;
        for chunk in items.chunks(self.batch_size) {
            for item in chunk {
                if item.is_object() {
                    processed += 1;
                } else {
                    failed += 1;
                }
            }
            progress.update(ProgressUpdate {
                processed_items: Some(processed + failed),
                total_items: Some(total as u64),
                message: Some(format!("processed {}, failed {}", processed, failed)),
                ..ProgressUpdate::default()
            });
            // Chunk boundaries are the cancellation points of this handler.
            tokio::task::yield_now().await;
        }
        Ok(json!({
            "total_items": total,
            "processed": processed,
            "failed": failed,
        }))
    }
}

/// Pulls the records handed to the task, chunk by chunk.
pub struct DataPullHandler {
    batch_size: usize,
}

impl DataPullHandler {
    pub fn new(batch_size: usize) -> DataPullHandler {
        DataPullHandler {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for DataPullHandler {
    async fn execute(
        &self,
        _: &Context,
        task: &TaskEnvelope,
        progress: ProgressReporter,
    ) -> Result<Value> {
        let records = task
            .kwargs
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let source = task
            .kwargs
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let total = records.len() as u64;
        let mut pulled = 0u64;
        for chunk in records.chunks(self.batch_size) {
            pulled += chunk.len() as u64;
            progress.update(ProgressUpdate {
                processed_items: Some(pulled),
                total_items: Some(total),
                message: Some(format!("pulled {}/{} records", pulled, total)),
                ..ProgressUpdate::default()
            });
            tokio::task::yield_now().await;
        }
        Ok(json!({
            "records_pulled": pulled,
            "source": source,
            "pulled_at": Utc::now(),
        }))
    }
}

/// Pushes the records handed to the task, chunk by chunk.
pub struct DataPushHandler {
    batch_size: usize,
}

impl DataPushHandler {
    pub fn new(batch_size: usize) -> DataPushHandler {
        DataPushHandler {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for DataPushHandler {
    async fn execute(
        &self,
        _: &Context,
        task: &TaskEnvelope,
        progress: ProgressReporter,
    ) -> Result<Value> {
        let records = task
            .kwargs
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let target = task
            .kwargs
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let total = records.len() as u64;
        let mut pushed = 0u64;
        for chunk in records.chunks(self.batch_size) {
            pushed += chunk.len() as u64;
            progress.update(ProgressUpdate {
                processed_items: Some(pushed),
                total_items: Some(total),
                message: Some(format!("pushed {}/{} records", pushed, total)),
                ..ProgressUpdate::default()
            });
            tokio::task::yield_now().await;
        }
        Ok(json!({
            "records_pushed": pushed,
            "target": target,
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use tributary_context::Context;
    use tributary_events::checkpoint::Checkpoints;
    use tributary_events::checkpoint::MemoryCheckpoints;
    use tributary_events::ChangeEvent;
    use tributary_events::EventPosition;
    use tributary_events::Operation;
    use tributary_tasks::ProgressReporter;
    use tributary_tasks::TaskEnvelope;
    use tributary_tasks::TaskHandler;
    use tributary_tasks::TaskTracker;
    use tributary_tasks::TaskType;

    use super::BatchProcessHandler;
    use super::DataTransformHandler;

    fn envelope(kwargs: serde_json::Value) -> TaskEnvelope {
        TaskEnvelope {
            task_id: "task-1".into(),
            task_type: TaskType::DataTransform,
            args: Vec::new(),
            kwargs: serde_json::from_value(kwargs).unwrap(),
            metadata: Default::default(),
        }
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new("task-1".into(), TaskTracker::new())
    }

    #[tokio::test]
    async fn transform_saves_checkpoint() {
        let context = Context::fixture();
        let checkpoints = Checkpoints::from(MemoryCheckpoints::new());
        let handler = DataTransformHandler::new(checkpoints.clone());

        let mut row = std::collections::BTreeMap::new();
        row.insert("id".to_string(), json!(7));
        let mut event = ChangeEvent::build(Operation::Insert, "orders")
            .after(row)
            .position(EventPosition::at_offset("cdc.shop.orders", 1, 99))
            .finish()
            .unwrap();
        event
            .metadata
            .insert("source".into(), json!("orders-cdc"));

        let task = envelope(json!({ "event": &event }));
        let result = handler.execute(&context, &task, reporter()).await.unwrap();
        assert_eq!(result["table"], json!("orders"));
        assert_eq!(result["row"]["id"], json!(7));

        let saved = checkpoints
            .load(&context, "orders-cdc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.last_event_id, event.id);
        assert_eq!(saved.last_committed_cursor.offset, Some(99));
    }

    #[tokio::test]
    async fn transform_without_event_fails() {
        let context = Context::fixture();
        let handler = DataTransformHandler::new(Checkpoints::from(MemoryCheckpoints::new()));
        let task = envelope(json!({}));
        let error = handler
            .execute(&context, &task, reporter())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("no change event"));
    }

    #[tokio::test]
    async fn batch_process_counts_items() {
        let context = Context::fixture();
        let handler = BatchProcessHandler::new(2);
        let task = envelope(json!({
            "items": [{"id": 1}, {"id": 2}, "not-an-object", {"id": 3}],
        }));
        let result = handler.execute(&context, &task, reporter()).await.unwrap();
        assert_eq!(result["total_items"], json!(4));
        assert_eq!(result["processed"], json!(3));
        assert_eq!(result["failed"], json!(1));
    }
}
