//! Task handlers and their registry.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use serde_json::Value;

use tributary_context::Context;

use crate::error::HandlerAlreadyRegistered;
use crate::progress::ProgressUpdate;
use crate::task::TaskEnvelope;
use crate::task::TaskType;
use crate::tracker::TaskTracker;

/// Logic invoked to execute tasks of one type.
///
/// Handlers must be idempotent: the plane guarantees at-least-once delivery,
/// so a handler can observe the same task twice. Handlers report failure by
/// returning an error; the queue retry policy decides what happens next.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task and return its result value.
    async fn execute(
        &self,
        context: &Context,
        task: &TaskEnvelope,
        progress: ProgressReporter,
    ) -> Result<Value>;
}

/// Push progress updates for a task; handed to handlers at execution time.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    tracker: TaskTracker,
}

impl ProgressReporter {
    /// Reporter pushing updates for `task_id` into the tracker.
    pub fn new(task_id: String, tracker: TaskTracker) -> ProgressReporter {
        ProgressReporter { task_id, tracker }
    }

    /// Record the latest progress for the task.
    ///
    /// Handlers may push any number of updates; the manager keeps the latest.
    pub fn update(&self, update: ProgressUpdate) {
        self.tracker.update_progress(&self.task_id, update);
    }
}

/// Registry of handlers by task type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<Mutex<HashMap<TaskType, Arc<dyn TaskHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Install the handler for a task type.
    ///
    /// Each task type accepts exactly one handler.
    pub fn register<H>(&self, task_type: TaskType, handler: H) -> Result<()>
    where
        H: TaskHandler + 'static,
    {
        let mut handlers = self.handlers.lock().expect("handler registry poisoned");
        if handlers.contains_key(&task_type) {
            anyhow::bail!(HandlerAlreadyRegistered::new(task_type.as_str()));
        }
        handlers.insert(task_type, Arc::new(handler));
        Ok(())
    }

    /// Fetch the handler for a task type, if one is registered.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.lock().expect("handler registry poisoned");
        handlers.get(&task_type).cloned()
    }

    /// Task types with a registered handler.
    pub fn task_types(&self) -> Vec<TaskType> {
        let handlers = self.handlers.lock().expect("handler registry poisoned");
        handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::Value;

    use tributary_context::Context;

    use super::HandlerRegistry;
    use super::ProgressReporter;
    use super::TaskHandler;
    use crate::error::HandlerAlreadyRegistered;
    use crate::task::TaskEnvelope;
    use crate::task::TaskType;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl TaskHandler for NoopHandler {
        async fn execute(
            &self,
            _: &Context,
            _: &TaskEnvelope,
            _: ProgressReporter,
        ) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .register(TaskType::DataTransform, NoopHandler)
            .unwrap();
        let error = registry
            .register(TaskType::DataTransform, NoopHandler)
            .unwrap_err();
        assert!(error.is::<HandlerAlreadyRegistered>());
    }

    #[test]
    fn lookup_by_type() {
        let registry = HandlerRegistry::new();
        registry.register(TaskType::DataPull, NoopHandler).unwrap();
        assert!(registry.get(TaskType::DataPull).is_some());
        assert!(registry.get(TaskType::DataPush).is_none());
    }
}
