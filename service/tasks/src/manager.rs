//! The unified async task manager.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tributary_context::Context;
use tributary_queue::QueueConf;
use tributary_queue::QueueManager;
use tributary_queue::QueueMode;

use crate::backend::BrokerTaskBackend;
use crate::backend::LocalExecutor;
use crate::backend::LocalTaskBackend;
use crate::backend::QueueTaskBackend;
use crate::backend::TaskBackend;
use crate::backend::TaskSubmission;
use crate::conf::TaskManagerConf;
use crate::error::BackendUnavailable;
use crate::handler::HandlerRegistry;
use crate::handler::TaskHandler;
use crate::progress::ProgressUpdate;
use crate::progress::TaskProgress;
use crate::progress::TaskResult;
use crate::task::BackendKind;
use crate::task::SubmitOptions;
use crate::task::TaskEnvelope;
use crate::task::TaskInfo;
use crate::task::TaskStatus;
use crate::task::TaskType;
use crate::tracker::TaskStats;
use crate::tracker::TaskTracker;
use crate::worker::WorkerPool;

/// Interval between monitor loop sweeps.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a task result.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The unified async task manager.
///
/// Submits work to a pluggable backend (durable queue, broker topic, or
/// in-process executor), tracks lifecycle, progress and results, and runs
/// the worker pools consuming the durable queues.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    broker: Option<BrokerTaskBackend>,
    conf: TaskManagerConf,
    local: LocalTaskBackend,
    local_receiver: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<TaskSubmission>>>,
    queue: Option<QueueTaskBackend>,
    queues: Option<QueueManager>,
    registry: HandlerRegistry,
    runtime: Mutex<Option<Runtime>>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

struct Runtime {
    local_executor: JoinHandle<()>,
    monitor: JoinHandle<()>,
    pools: Vec<WorkerPool>,
    shutdown: watch::Sender<bool>,
}

impl TaskManager {
    /// Build a task manager from its configuration.
    ///
    /// `queues` enables the durable queue backend (and its worker pools);
    /// the broker backend is enabled by `conf.broker`. The local backend is
    /// always available.
    pub fn new(conf: TaskManagerConf, queues: Option<QueueManager>) -> Result<TaskManager> {
        let broker = conf
            .broker
            .as_ref()
            .map(|broker| BrokerTaskBackend::new(broker.clone()))
            .transpose()?;
        let (local, local_receiver) = LocalTaskBackend::channel();
        let queue = queues.clone().map(QueueTaskBackend::new);
        let semaphore = Arc::new(Semaphore::new(conf.workers.max_concurrent_tasks));
        let inner = ManagerInner {
            broker,
            conf,
            local,
            local_receiver: Mutex::new(Some(local_receiver)),
            queue,
            queues,
            registry: HandlerRegistry::new(),
            runtime: Mutex::new(None),
            semaphore,
            tracker: TaskTracker::new(),
        };
        Ok(TaskManager {
            inner: Arc::new(inner),
        })
    }

    /// Install the handler for a task type.
    ///
    /// Handlers must be registered before [`TaskManager::start`] so worker
    /// pools can be spawned for their queues.
    pub fn register_handler<H>(&self, task_type: TaskType, handler: H) -> Result<()>
    where
        H: TaskHandler + 'static,
    {
        self.inner.registry.register(task_type, handler)
    }

    /// Start the local executor, worker pools and monitor loop.
    pub fn start(&self, context: &Context) -> Result<()> {
        let mut runtime = self.inner.runtime.lock().expect("task runtime poisoned");
        if runtime.is_some() {
            return Ok(());
        }
        let (shutdown, _) = watch::channel(false);

        let receiver = self
            .inner
            .local_receiver
            .lock()
            .expect("task runtime poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("task manager cannot be restarted"))?;
        let executor = LocalExecutor::new(
            receiver,
            self.inner.registry.clone(),
            self.inner.tracker.clone(),
            Arc::clone(&self.inner.semaphore),
            Duration::from_secs(self.inner.conf.workers.task_timeout_secs),
            shutdown.subscribe(),
        );
        let local_executor = tokio::spawn(executor.run(context.clone()));

        // One worker pool per task type with a registered handler.
        let mut pools = Vec::new();
        if let Some(queues) = self.inner.queues.as_ref() {
            for task_type in self.inner.registry.task_types() {
                let queue = queues.create(QueueConf::new(task_type.queue_name(), QueueMode::Fifo));
                let pool = WorkerPool::start(
                    context,
                    queue,
                    self.inner.registry.clone(),
                    self.inner.tracker.clone(),
                    Arc::clone(&self.inner.semaphore),
                    &self.inner.conf.workers,
                    self.inner.conf.workers.workers_per_queue,
                );
                pools.push(pool);
            }
        }

        let monitor = tokio::spawn(TaskManager::monitor_loop(
            context.clone(),
            self.inner.tracker.clone(),
            shutdown.subscribe(),
        ));

        *runtime = Some(Runtime {
            local_executor,
            monitor,
            pools,
            shutdown,
        });
        slog::info!(context.logger, "Task manager started");
        Ok(())
    }

    /// Stop the monitor loop, worker pools and local executor.
    ///
    /// Each shutdown is awaited up to `deadline`; tasks that overrun are
    /// abandoned and their messages redelivered by the queue lease.
    pub async fn stop(&self, context: &Context, deadline: Duration) {
        let runtime = {
            let mut runtime = self.inner.runtime.lock().expect("task runtime poisoned");
            runtime.take()
        };
        let runtime = match runtime {
            None => return,
            Some(runtime) => runtime,
        };
        let _ = runtime.shutdown.send(true);
        runtime.monitor.abort();
        for pool in runtime.pools {
            pool.stop(context, deadline).await;
        }
        if tokio::time::timeout(deadline, runtime.local_executor)
            .await
            .is_err()
        {
            slog::warn!(
                context.logger,
                "Local task executor did not stop within the deadline"
            );
        }
        slog::info!(context.logger, "Task manager stopped");
    }

    /// Submit a task for execution and return its ID.
    pub async fn submit_task(
        &self,
        context: &Context,
        task_type: TaskType,
        args: Vec<Value>,
        kwargs: std::collections::BTreeMap<String, Value>,
        options: SubmitOptions,
    ) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let backend = options.backend.unwrap_or(self.inner.conf.default_backend);
        let now = Utc::now();
        let envelope = TaskEnvelope {
            task_id: task_id.clone(),
            task_type,
            args,
            kwargs,
            metadata: options.metadata.clone(),
        };
        let info = TaskInfo {
            task_id: task_id.clone(),
            task_type,
            args: envelope.args.clone(),
            kwargs: envelope.kwargs.clone(),
            priority: options.priority,
            backend,
            delay_seconds: options.delay.map(|delay| delay.as_secs()),
            expires_at: options
                .expires_in
                .map(|expiry| now + chrono::Duration::from_std(expiry).unwrap_or_default()),
            max_retries: options.max_retries.unwrap_or(3),
            metadata: options.metadata,
            submitted_at: now,
            started_at: None,
            status: TaskStatus::Pending,
        };
        self.inner.tracker.insert(info);

        let submission = TaskSubmission {
            envelope,
            priority: options.priority,
            delay: options.delay,
            expires_in: options.expires_in,
            max_retries: options.max_retries,
        };
        let backend_label = backend.to_string();
        let labels = [task_type.as_str(), backend_label.as_str()];
        crate::telemetry::SUBMIT_COUNT.with_label_values(&labels).inc();
        let submitted = match backend {
            BackendKind::Queue => match self.inner.queue.as_ref() {
                Some(queue) => queue.submit(context, submission).await,
                None => Err(BackendUnavailable::new(BackendKind::Queue).into()),
            },
            BackendKind::Broker => match self.inner.broker.as_ref() {
                Some(broker) => broker.submit(context, submission).await,
                None => Err(BackendUnavailable::new(BackendKind::Broker).into()),
            },
            BackendKind::Local => self.inner.local.submit(context, submission).await,
        };
        if let Err(error) = submitted {
            crate::telemetry::SUBMIT_ERR.with_label_values(&labels).inc();
            self.inner.tracker.fail(&task_id, error.to_string());
            return Err(error);
        }
        slog::info!(
            context.logger, "Submitted task";
            "task" => &task_id, "task_type" => task_type.as_str(), "backend" => %backend,
        );
        Ok(task_id)
    }

    /// Current status of a task, if this manager has seen it.
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.tracker.status(task_id)
    }

    /// Latest progress reported for a task.
    pub fn get_task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.inner.tracker.progress(task_id)
    }

    /// Result of a task, optionally waiting up to `timeout` for completion.
    pub async fn get_task_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Option<TaskResult> {
        if let Some(result) = self.inner.tracker.result(task_id) {
            return Some(result);
        }
        let timeout = timeout?;
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(result) = self.inner.tracker.result(task_id) {
                return Some(result);
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
        self.inner.tracker.result(task_id)
    }

    /// Mark a task as revoked.
    ///
    /// Undelivered copies are skipped at dispatch; a handler that already
    /// started is allowed to finish. Returns false for unknown or already
    /// terminal tasks.
    pub fn cancel_task(&self, context: &Context, task_id: &str) -> bool {
        let revoked = self.inner.tracker.revoke(task_id);
        if revoked {
            slog::info!(context.logger, "Revoked task"; "task" => task_id);
        }
        revoked
    }

    /// Record the latest progress for a task; called by handlers.
    pub fn update_progress(&self, task_id: &str, update: ProgressUpdate) {
        self.inner.tracker.update_progress(task_id, update);
    }

    /// Tasks still in an active state, with their progress.
    pub fn get_active_tasks(&self) -> Vec<(TaskInfo, TaskProgress)> {
        self.inner.tracker.active_tasks()
    }

    /// Aggregate counts over everything this manager has seen.
    pub fn get_task_stats(&self) -> TaskStats {
        self.inner.tracker.stats()
    }

    /// Prune completed task records older than the horizon.
    pub fn cleanup_completed_tasks(&self, older_than: Duration) -> usize {
        self.inner.tracker.cleanup(older_than)
    }

    /// Statistics for the durable queues backing this manager, if any.
    pub async fn queue_stats(
        &self,
        context: &Context,
    ) -> Result<HashMap<String, tributary_queue::QueueStats>> {
        match self.inner.queues.as_ref() {
            None => Ok(HashMap::new()),
            Some(queues) => queues.stats_all(context).await,
        }
    }

    async fn monitor_loop(
        context: Context,
        tracker: TaskTracker,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            }
            let stats = tracker.stats();
            slog::debug!(
                context.logger, "Task monitor sweep";
                "active" => stats.active_tasks,
                "completed" => stats.completed_tasks,
                "failed" => stats.failed_tasks,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use serde_json::json;
    use serde_json::Value;

    use tributary_context::Context;
    use tributary_queue::QueueManager;

    use super::TaskManager;
    use crate::conf::TaskManagerConf;
    use crate::handler::ProgressReporter;
    use crate::handler::TaskHandler;
    use crate::progress::ProgressUpdate;
    use crate::task::BackendKind;
    use crate::task::SubmitOptions;
    use crate::task::TaskEnvelope;
    use crate::task::TaskStatus;
    use crate::task::TaskType;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl TaskHandler for EchoHandler {
        async fn execute(
            &self,
            _: &Context,
            task: &TaskEnvelope,
            progress: ProgressReporter,
        ) -> Result<Value> {
            progress.update(ProgressUpdate {
                processed_items: Some(1),
                total_items: Some(1),
                message: Some("done".into()),
                ..ProgressUpdate::default()
            });
            Ok(json!({ "echo": task.args }))
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl TaskHandler for FailingHandler {
        async fn execute(
            &self,
            _: &Context,
            _: &TaskEnvelope,
            _: ProgressReporter,
        ) -> Result<Value> {
            anyhow::bail!("handler exploded")
        }
    }

    /// Handler tracking how many invocations overlap.
    struct GaugedHandler {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TaskHandler for GaugedHandler {
        async fn execute(
            &self,
            _: &Context,
            _: &TaskEnvelope,
            _: ProgressReporter,
        ) -> Result<Value> {
            let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn local_manager() -> TaskManager {
        let conf = TaskManagerConf {
            default_backend: BackendKind::Local,
            ..TaskManagerConf::default()
        };
        TaskManager::new(conf, None).unwrap()
    }

    fn local_options() -> SubmitOptions {
        SubmitOptions::default()
    }

    #[tokio::test]
    async fn local_task_success_with_result() {
        let context = Context::fixture();
        let manager = local_manager();
        manager
            .register_handler(TaskType::DataTransform, EchoHandler)
            .unwrap();
        manager.start(&context).unwrap();

        let task_id = manager
            .submit_task(
                &context,
                TaskType::DataTransform,
                vec![json!(42)],
                BTreeMap::new(),
                local_options(),
            )
            .await
            .unwrap();
        let result = manager
            .get_task_result(&task_id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.result, Some(json!({ "echo": [42] })));
        let started = result.started_at.unwrap();
        assert!(started <= result.completed_at);

        let progress = manager.get_task_progress(&task_id).unwrap();
        assert_eq!(progress.percentage, 100.0);
        manager.stop(&context, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn local_task_failure_records_error() {
        let context = Context::fixture();
        let manager = local_manager();
        manager
            .register_handler(TaskType::DataPush, FailingHandler)
            .unwrap();
        manager.start(&context).unwrap();

        let task_id = manager
            .submit_task(
                &context,
                TaskType::DataPush,
                Vec::new(),
                BTreeMap::new(),
                local_options(),
            )
            .await
            .unwrap();
        let result = manager
            .get_task_result(&task_id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("handler exploded"));
        manager.stop(&context, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unregistered_task_type_fails_without_retry() {
        let context = Context::fixture();
        let manager = local_manager();
        manager.start(&context).unwrap();

        let task_id = manager
            .submit_task(
                &context,
                TaskType::Cleanup,
                Vec::new(),
                BTreeMap::new(),
                local_options(),
            )
            .await
            .unwrap();
        let result = manager
            .get_task_result(&task_id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Failure);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("no handler registered"));
        manager.stop(&context, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancel_before_dispatch_prevents_execution() {
        let context = Context::fixture();
        let manager = local_manager();
        manager
            .register_handler(TaskType::DataTransform, EchoHandler)
            .unwrap();
        manager.start(&context).unwrap();

        let options = SubmitOptions {
            delay: Some(Duration::from_millis(200)),
            ..SubmitOptions::default()
        };
        let task_id = manager
            .submit_task(
                &context,
                TaskType::DataTransform,
                Vec::new(),
                BTreeMap::new(),
                options,
            )
            .await
            .unwrap();
        assert!(manager.cancel_task(&context, &task_id));

        let result = manager
            .get_task_result(&task_id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Revoked);
        assert!(result.result.is_none());
        manager.stop(&context, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn queue_backend_executes_through_worker_pool() {
        let context = Context::fixture();
        let queues = QueueManager::memory();
        let conf = TaskManagerConf::default();
        let manager = TaskManager::new(conf, Some(queues)).unwrap();
        manager
            .register_handler(TaskType::DataTransform, EchoHandler)
            .unwrap();
        manager.start(&context).unwrap();

        let task_id = manager
            .submit_task(
                &context,
                TaskType::DataTransform,
                vec![json!("via-queue")],
                BTreeMap::new(),
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        let result = manager
            .get_task_result(&task_id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.result, Some(json!({ "echo": ["via-queue"] })));

        let stats = manager.queue_stats(&context).await.unwrap();
        let queue_stats = &stats["data_transform_queue"];
        assert_eq!(queue_stats.completed, 1);
        manager.stop(&context, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn retry_then_dead_letter_through_worker_pool() {
        let context = Context::fixture();
        let queues = QueueManager::memory();
        let manager = TaskManager::new(TaskManagerConf::default(), Some(queues.clone())).unwrap();
        manager
            .register_handler(TaskType::DataPush, FailingHandler)
            .unwrap();
        manager.start(&context).unwrap();

        let options = SubmitOptions {
            max_retries: Some(0),
            ..SubmitOptions::default()
        };
        let task_id = manager
            .submit_task(
                &context,
                TaskType::DataPush,
                Vec::new(),
                BTreeMap::new(),
                options,
            )
            .await
            .unwrap();
        let result = manager
            .get_task_result(&task_id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Failure);
        let stats = manager.queue_stats(&context).await.unwrap();
        assert_eq!(stats["data_push_queue"].dlq_size, 1);
        manager.stop(&context, Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_bound() {
        let context = Context::fixture();
        let mut conf = TaskManagerConf {
            default_backend: BackendKind::Local,
            ..TaskManagerConf::default()
        };
        conf.workers.max_concurrent_tasks = 5;
        let manager = TaskManager::new(conf, None).unwrap();

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        manager
            .register_handler(
                TaskType::BatchProcess,
                GaugedHandler {
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                },
            )
            .unwrap();
        manager.start(&context).unwrap();

        let mut task_ids = Vec::new();
        for index in 0..25 {
            let task_id = manager
                .submit_task(
                    &context,
                    TaskType::BatchProcess,
                    vec![json!(index)],
                    BTreeMap::new(),
                    SubmitOptions::default(),
                )
                .await
                .unwrap();
            task_ids.push(task_id);
        }
        for task_id in &task_ids {
            let result = manager
                .get_task_result(task_id, Some(Duration::from_secs(10)))
                .await
                .unwrap();
            assert_eq!(result.status, TaskStatus::Success);
        }
        assert!(peak.load(Ordering::SeqCst) <= 5);
        manager.stop(&context, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cleanup_prunes_completed_tasks() {
        let context = Context::fixture();
        let manager = local_manager();
        manager
            .register_handler(TaskType::DataTransform, EchoHandler)
            .unwrap();
        manager.start(&context).unwrap();

        let task_id = manager
            .submit_task(
                &context,
                TaskType::DataTransform,
                Vec::new(),
                BTreeMap::new(),
                local_options(),
            )
            .await
            .unwrap();
        manager
            .get_task_result(&task_id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = manager.cleanup_completed_tasks(Duration::ZERO);
        assert_eq!(removed, 1);
        assert!(manager.get_task_status(&task_id).is_none());
        manager.stop(&context, Duration::from_secs(1)).await;
    }
}
