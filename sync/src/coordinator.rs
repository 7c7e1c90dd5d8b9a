//! Wiring and lifecycle of the sync plane.
use std::collections::BTreeMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use serde_json::json;
use serde_json::Value;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use tributary_conf::Conf;
use tributary_conf::SourceFailurePolicy;
use tributary_conf::SyncMode;
use tributary_context::Context;
use tributary_events::checkpoint::Checkpoints;
use tributary_events::checkpoint::RedisCheckpoints;
use tributary_events::ChangeEvent;
use tributary_healthcheck::HealthChecks;
use tributary_healthcheck::HealthStatus;
use tributary_queue::QueueManager;
use tributary_source::EventStream;
use tributary_source::RecvTimeout;
use tributary_source::Source;
use tributary_source::SourceManager;
use tributary_source_connect::ConnectSource;
use tributary_source_pglogical::PgLogicalSource;
use tributary_tasks::SubmitOptions;
use tributary_tasks::TaskManager;
use tributary_tasks::TaskType;

/// Deadline applied to each component shutdown.
const STOP_DEADLINE: Duration = Duration::from_secs(10);

/// Bound on each wait for events in the pump loop; the loop re-checks the
/// shutdown signal at this cadence.
const PUMP_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Sources failed to start under the `stop` failure policy.
#[derive(Debug, thiserror::Error)]
#[error("{failed} of {total} sources failed to start")]
pub struct SourceStartFailed {
    pub failed: usize,
    pub total: usize,
}

/// Externally provided backends, for embedding and tests.
pub struct Dependencies {
    pub checkpoints: Checkpoints,
    pub queues: Option<QueueManager>,
}

/// Wires sources, the task manager and the health loop into one plane.
pub struct SyncCoordinator {
    checkpoints: Checkpoints,
    conf: Conf,
    counters: Arc<SyncCounters>,
    health: Arc<std::sync::Mutex<HealthChecks>>,
    loops: Vec<JoinHandle<()>>,
    queues: Option<QueueManager>,
    shutdown: Option<watch::Sender<bool>>,
    sources: Arc<Mutex<SourceManager>>,
    stream: Option<EventStream>,
    tasks: TaskManager,
}

#[derive(Default)]
struct SyncCounters {
    events_processed: AtomicU64,
    tasks_submitted: AtomicU64,
    last_event_ms: AtomicI64,
    started_ms: AtomicI64,
}

impl SyncCounters {
    fn last_event_at(&self) -> Option<DateTime<Utc>> {
        millis_to_time(self.last_event_ms.load(Ordering::Relaxed))
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        millis_to_time(self.started_ms.load(Ordering::Relaxed))
    }
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

impl SyncCoordinator {
    /// Build the plane with redis backed queues and checkpoints.
    pub async fn initialize(context: &Context, conf: Conf) -> Result<SyncCoordinator> {
        let queues = if conf.tasks.enabled {
            Some(QueueManager::redis(&conf.store.redis_url).await?)
        } else {
            None
        };
        // Checkpoints keep their own connection; components do not share
        // store clients.
        let client = redis::Client::open(conf.store.redis_url.as_str())?;
        let connection = client.get_connection_manager().await?;
        let checkpoints = Checkpoints::from(RedisCheckpoints::new(connection));
        let dependencies = Dependencies {
            checkpoints,
            queues,
        };
        SyncCoordinator::initialize_with(context, conf, dependencies).await
    }

    /// Build the plane over externally provided backends.
    pub async fn initialize_with(
        context: &Context,
        conf: Conf,
        dependencies: Dependencies,
    ) -> Result<SyncCoordinator> {
        let Dependencies {
            checkpoints,
            queues,
        } = dependencies;

        // The process wide performance knobs override the worker defaults.
        let mut manager_conf = conf.tasks.manager.clone();
        manager_conf.workers.max_concurrent_tasks = conf.performance.max_concurrent_tasks;
        manager_conf.workers.task_timeout_secs = conf.performance.task_timeout_seconds;
        let tasks = TaskManager::new(manager_conf, queues.clone())?;
        tasks.register_handler(
            TaskType::DataTransform,
            crate::handlers::DataTransformHandler::new(checkpoints.clone()),
        )?;
        tasks.register_handler(
            TaskType::BatchProcess,
            crate::handlers::BatchProcessHandler::new(conf.performance.batch_size),
        )?;
        tasks.register_handler(
            TaskType::DataPull,
            crate::handlers::DataPullHandler::new(conf.performance.batch_size),
        )?;
        tasks.register_handler(
            TaskType::DataPush,
            crate::handlers::DataPushHandler::new(conf.performance.batch_size),
        )?;

        let mut sources = SourceManager::new();
        let run_cdc = matches!(conf.mode, SyncMode::CdcOnly | SyncMode::Hybrid);
        let run_replication = matches!(conf.mode, SyncMode::ReplicationOnly | SyncMode::Hybrid);
        if run_cdc && conf.connect.enabled {
            for source_conf in &conf.connect.sources {
                sources.register(Box::new(ConnectSource::new(source_conf.clone())));
            }
        }
        if run_replication && conf.pglogical.enabled {
            for source_conf in &conf.pglogical.sources {
                sources.register(Box::new(PgLogicalSource::new(source_conf.clone())));
            }
        }
        let stream = sources.events();

        let mut health = HealthChecks::new();
        let health_tasks = tasks.clone();
        let failure_ratio = conf.monitoring.task_failure_ratio;
        health.register("tasks", move || {
            let stats = health_tasks.get_task_stats();
            let total = stats.total_tasks.max(1) as f64;
            let ratio = stats.failed_tasks as f64 / total;
            if ratio > failure_ratio {
                HealthStatus::Degraded(format!("task failure ratio {:.2}", ratio))
            } else {
                HealthStatus::Healthy
            }
        });

        slog::info!(
            context.logger, "Sync plane initialised";
            "name" => &conf.name, "sources" => sources.len(),
        );
        Ok(SyncCoordinator {
            checkpoints,
            conf,
            counters: Arc::new(SyncCounters::default()),
            health: Arc::new(std::sync::Mutex::new(health)),
            loops: Vec::new(),
            queues,
            shutdown: None,
            sources: Arc::new(Mutex::new(sources)),
            stream,
            tasks,
        })
    }

    /// Add a capture source beyond the configured ones.
    ///
    /// Must be called before [`SyncCoordinator::start`].
    pub async fn add_source(&self, source: Box<dyn Source>) {
        self.sources.lock().await.register(source);
    }

    /// Checkpoint store used by the data transform handler.
    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    /// The task manager, for direct task submission by embedders.
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Start sources, the task manager, the event pump and the health loop.
    pub async fn start(&mut self, context: &Context) -> Result<()> {
        if self.shutdown.is_some() {
            slog::warn!(context.logger, "Sync plane is already running");
            return Ok(());
        }
        let (shutdown, _) = watch::channel(false);

        {
            let mut sources = self.sources.lock().await;
            let total = sources.len();
            let started = sources.start_all(context).await;
            if started < total && self.conf.on_source_failure == SourceFailurePolicy::Stop {
                sources.stop_all(context).await;
                anyhow::bail!(SourceStartFailed {
                    failed: total - started,
                    total,
                });
            }
        }
        self.tasks.start(context)?;

        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow::anyhow!("sync plane cannot be restarted"))?;
        self.counters
            .started_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.loops.push(tokio::spawn(SyncCoordinator::pump_loop(
            context.clone(),
            stream,
            self.tasks.clone(),
            self.queues.clone(),
            Arc::clone(&self.counters),
            self.conf.monitoring.queue_high_water,
            Duration::from_secs(self.conf.monitoring.backpressure_max_wait),
            shutdown.subscribe(),
        )));
        if self.conf.monitoring.enabled {
            self.loops.push(tokio::spawn(SyncCoordinator::health_loop(
                context.clone(),
                Arc::clone(&self.sources),
                self.tasks.clone(),
                Arc::clone(&self.health),
                Duration::from_secs(self.conf.monitoring.health_check_interval),
                shutdown.subscribe(),
            )));
        }
        self.shutdown = Some(shutdown);
        slog::info!(context.logger, "Sync plane started"; "name" => &self.conf.name);
        Ok(())
    }

    /// Stop in reverse order: loops, then the task manager, then sources.
    pub async fn stop(&mut self, context: &Context) {
        let shutdown = match self.shutdown.take() {
            None => return,
            Some(shutdown) => shutdown,
        };
        let _ = shutdown.send(true);
        for task in self.loops.drain(..) {
            if tokio::time::timeout(STOP_DEADLINE, task).await.is_err() {
                slog::warn!(
                    context.logger,
                    "Coordinator loop did not stop within the deadline"
                );
            }
        }
        self.tasks.stop(context, STOP_DEADLINE).await;
        self.sources.lock().await.stop_all(context).await;
        slog::info!(context.logger, "Sync plane stopped"; "name" => &self.conf.name);
    }

    /// Comprehensive status of the plane.
    pub async fn status(&self, context: &Context) -> Result<crate::SyncStatus> {
        let sources = self.sources.lock().await.stats();
        let queues = self.tasks.queue_stats(context).await?;
        let health = self.health.lock().expect("health registry poisoned").run();
        let events_processed = self.counters.events_processed.load(Ordering::Relaxed);
        let tasks_submitted = self.counters.tasks_submitted.load(Ordering::Relaxed);
        let started_at = self.counters.started_at();
        Ok(crate::SyncStatus {
            name: self.conf.name.clone(),
            mode: self.conf.mode,
            running: self.shutdown.is_some(),
            started_at,
            events_processed,
            tasks_submitted,
            last_event_at: self.counters.last_event_at(),
            throughput: crate::Throughput::since(started_at, events_processed, tasks_submitted),
            sources,
            tasks: self.tasks.get_task_stats(),
            queues,
            health,
        })
    }

    /// Receive events from the fan-in and turn each into a transform task.
    #[allow(clippy::too_many_arguments)]
    async fn pump_loop(
        context: Context,
        mut stream: EventStream,
        tasks: TaskManager,
        queues: Option<QueueManager>,
        counters: Arc<SyncCounters>,
        queue_high_water: u64,
        backpressure_cap: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                received = stream.recv_timeout(PUMP_RECV_TIMEOUT) => match received {
                    RecvTimeout::Event(event) => event,
                    RecvTimeout::TimedOut => continue,
                    RecvTimeout::Closed => {
                        slog::info!(
                            context.logger,
                            "Every capture source has terminated; event pump idle"
                        );
                        break;
                    }
                },
            };

            // Backpressure: when the transform queue is over the high water
            // mark, slow intake with doubling waits before submitting.
            if let Some(queues) = queues.as_ref() {
                let mut wait = Duration::from_secs(1);
                loop {
                    let depth = match queues.get(&TaskType::DataTransform.queue_name()) {
                        Err(_) => break,
                        Ok(queue) => queue
                            .stats(&context)
                            .await
                            .map(|stats| stats.primary_size)
                            .unwrap_or(0),
                    };
                    if depth < queue_high_water {
                        break;
                    }
                    slog::warn!(
                        context.logger, "Transform queue over high water, slowing intake";
                        "depth" => depth, "high_water" => queue_high_water,
                    );
                    tokio::time::sleep(wait).await;
                    wait = (wait * 2).min(backpressure_cap);
                }
            }

            if let Err(error) =
                SyncCoordinator::submit_transform(&context, &tasks, &counters, event).await
            {
                slog::error!(
                    context.logger, "Failed to submit transform task for change event";
                    "error" => %error,
                );
            }
        }
    }

    /// Submit the data transform task derived from one change event.
    async fn submit_transform(
        context: &Context,
        tasks: &TaskManager,
        counters: &SyncCounters,
        event: ChangeEvent,
    ) -> Result<()> {
        counters.events_processed.fetch_add(1, Ordering::Relaxed);
        counters
            .last_event_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let source = event
            .metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), json!(source));
        metadata.insert("table".to_string(), json!(event.table));
        metadata.insert("operation".to_string(), json!(event.operation));
        let mut kwargs = BTreeMap::new();
        kwargs.insert("event".to_string(), serde_json::to_value(&event)?);

        let options = SubmitOptions {
            metadata,
            ..SubmitOptions::default()
        };
        tasks
            .submit_task(context, TaskType::DataTransform, Vec::new(), kwargs, options)
            .await?;
        counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Periodic health sweep; observations are logged, never acted on.
    async fn health_loop(
        context: Context,
        sources: Arc<Mutex<SourceManager>>,
        tasks: TaskManager,
        health: Arc<std::sync::Mutex<HealthChecks>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            for stat in sources.lock().await.stats() {
                if !stat.running {
                    slog::warn!(
                        context.logger, "Source is not running";
                        "source" => stat.name,
                    );
                }
            }
            let stats = tasks.get_task_stats();
            let total = stats.total_tasks.max(1) as f64;
            let ratio = stats.failed_tasks as f64 / total;
            if ratio > 0.1 {
                slog::warn!(
                    context.logger, "High task failure rate";
                    "ratio" => format!("{:.2}", ratio),
                );
            }
            let results = health.lock().expect("health registry poisoned").run();
            for (name, status) in results {
                if !status.is_healthy() {
                    slog::warn!(
                        context.logger, "Health check failed";
                        "check" => name,
                    );
                }
            }
            slog::debug!(context.logger, "Health check completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::json;

    use tributary_context::Context;
    use tributary_events::checkpoint::Checkpoints;
    use tributary_events::checkpoint::MemoryCheckpoints;
    use tributary_events::ChangeEvent;
    use tributary_events::EventPosition;
    use tributary_events::Operation;
    use tributary_queue::QueueManager;
    use tributary_source::ScriptedSource;

    use super::Dependencies;
    use super::SyncCoordinator;

    fn conf(mode: &str, backend: &str) -> tributary_conf::Conf {
        serde_json::from_value(json!({
            "name": "unit-plane",
            "mode": mode,
            "tasks": { "manager": { "default_backend": backend } },
            "performance": { "max_concurrent_tasks": 5 },
            "monitoring": { "health_check_interval": 1 },
        }))
        .unwrap()
    }

    fn memory_dependencies() -> Dependencies {
        Dependencies {
            checkpoints: Checkpoints::from(MemoryCheckpoints::new()),
            queues: Some(QueueManager::memory()),
        }
    }

    fn event(source_hint: &str, table: &str, key: i64) -> ChangeEvent {
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), json!(key));
        ChangeEvent::build(Operation::Insert, table)
            .after(row)
            .position(EventPosition::at_offset(
                format!("cdc.{}.{}", source_hint, table),
                0,
                key,
            ))
            .finish()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hybrid_plane_processes_events_to_success() {
        let context = Context::fixture();
        let mut coordinator =
            SyncCoordinator::initialize_with(&context, conf("hybrid", "queue"), memory_dependencies())
                .await
                .unwrap();

        // 100 events across 3 scripted sources, S6 style.
        for (index, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
            let count: i64 = if index == 0 { 34 } else { 33 };
            let events = (0..count).map(|key| event(name, "orders", key)).collect();
            coordinator
                .add_source(Box::new(ScriptedSource::new(*name, events)))
                .await;
        }
        coordinator.start(&context).await.unwrap();

        // Wait for every task to complete.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let stats = coordinator.tasks().get_task_stats();
            if stats.completed_tasks + stats.failed_tasks >= 100 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "tasks did not complete in time: {:?}",
                stats
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let status = coordinator.status(&context).await.unwrap();
        assert_eq!(status.events_processed, 100);
        assert_eq!(status.tasks_submitted, 100);
        assert_eq!(status.tasks.completed_tasks, 100);
        assert_eq!(status.tasks.failed_tasks, 0);

        // The transform handler checkpoints each source as it confirms
        // durable handling.
        let checkpoint = coordinator
            .checkpoints()
            .load(&context, "alpha")
            .await
            .unwrap();
        assert!(checkpoint.is_some());

        coordinator.stop(&context).await;
    }

    #[tokio::test]
    async fn stop_completes_within_deadline() {
        let context = Context::fixture();
        let mut coordinator =
            SyncCoordinator::initialize_with(&context, conf("hybrid", "local"), memory_dependencies())
                .await
                .unwrap();
        coordinator
            .add_source(Box::new(ScriptedSource::new("alpha", Vec::new())))
            .await;
        coordinator.start(&context).await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(15), coordinator.stop(&context));
        stopped.await.expect("stop overran its deadline");
    }

    #[tokio::test]
    async fn stop_policy_fails_start_when_sources_fail() {
        let context = Context::fixture();
        let mut base = conf("hybrid", "local");
        base.on_source_failure = tributary_conf::SourceFailurePolicy::Stop;
        let mut coordinator =
            SyncCoordinator::initialize_with(&context, base, memory_dependencies())
                .await
                .unwrap();
        coordinator
            .add_source(Box::new(ScriptedSource::failing("broken")))
            .await;
        let error = coordinator.start(&context).await.unwrap_err();
        assert!(error.is::<super::SourceStartFailed>());
    }

    #[tokio::test]
    async fn continue_policy_keeps_running_with_failed_source() {
        let context = Context::fixture();
        let mut coordinator =
            SyncCoordinator::initialize_with(&context, conf("hybrid", "local"), memory_dependencies())
                .await
                .unwrap();
        coordinator
            .add_source(Box::new(ScriptedSource::failing("broken")))
            .await;
        coordinator
            .add_source(Box::new(ScriptedSource::new(
                "alpha",
                vec![event("alpha", "orders", 1)],
            )))
            .await;
        coordinator.start(&context).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = coordinator.status(&context).await.unwrap();
            if status.events_processed >= 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        coordinator.stop(&context).await;
    }

    #[tokio::test]
    async fn async_only_mode_has_no_sources() {
        let context = Context::fixture();
        let coordinator = SyncCoordinator::initialize_with(
            &context,
            conf("async_only", "local"),
            memory_dependencies(),
        )
        .await
        .unwrap();
        let status = coordinator.status(&context).await.unwrap();
        assert!(status.sources.is_empty());
        assert!(!status.running);
    }
}
