//! Data object storing the tributary process configuration.
use serde::Deserialize;
use serde::Serialize;

use tributary_source_connect::ConnectSourceConf;
use tributary_source_pglogical::PgLogicalConf;
use tributary_tasks::TaskManagerConf;

/// Which capture planes the process runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Broker-connect CDC sources only.
    CdcOnly,
    /// Logical replication sources only.
    ReplicationOnly,
    /// Both capture planes.
    Hybrid,
    /// No sources; task processing only.
    AsyncOnly,
}

impl Default for SyncMode {
    fn default() -> SyncMode {
        SyncMode::Hybrid
    }
}

/// What the coordinator does when a source fails terminally.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFailurePolicy {
    /// Log the failure and keep the remaining sources running.
    Continue,
    /// Initiate coordinator shutdown.
    Stop,
}

impl Default for SourceFailurePolicy {
    fn default() -> SourceFailurePolicy {
        SourceFailurePolicy::Continue
    }
}

/// Global configuration for the tributary process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conf {
    /// Name of this sync plane instance.
    pub name: String,

    /// Which capture planes the process runs.
    #[serde(default)]
    pub mode: SyncMode,

    /// Broker-connect CDC sources.
    #[serde(default)]
    pub connect: ConnectSection,

    /// Logical replication sources.
    #[serde(default)]
    pub pglogical: PgLogicalSection,

    /// Async task processing.
    #[serde(default)]
    pub tasks: TasksSection,

    /// Key-value store backing queues and checkpoints.
    #[serde(default)]
    pub store: StoreConf,

    /// Performance knobs.
    #[serde(default)]
    pub performance: PerformanceConf,

    /// Health loop and backpressure monitoring.
    #[serde(default)]
    pub monitoring: MonitoringConf,

    /// What the coordinator does when a source fails terminally.
    #[serde(default)]
    pub on_source_failure: SourceFailurePolicy,
}

/// Broker-connect CDC sources section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectSection {
    /// Disable to skip these sources even in CDC modes.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// One entry per upstream connector to own.
    #[serde(default)]
    pub sources: Vec<ConnectSourceConf>,
}

impl Default for ConnectSection {
    fn default() -> ConnectSection {
        ConnectSection {
            enabled: true,
            sources: Vec::new(),
        }
    }
}

/// Logical replication sources section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PgLogicalSection {
    /// Disable to skip these sources even in replication modes.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// One entry per replication topology to manage.
    #[serde(default)]
    pub sources: Vec<PgLogicalConf>,
}

impl Default for PgLogicalSection {
    fn default() -> PgLogicalSection {
        PgLogicalSection {
            enabled: true,
            sources: Vec::new(),
        }
    }
}

/// Async task processing section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TasksSection {
    /// Disable to skip task processing entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Task manager configuration (default backend, workers, broker).
    #[serde(default)]
    pub manager: TaskManagerConf,
}

impl Default for TasksSection {
    fn default() -> TasksSection {
        TasksSection {
            enabled: true,
            manager: TaskManagerConf::default(),
        }
    }
}

/// Key-value store configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConf {
    /// URL of the redis class store.
    #[serde(default = "StoreConf::default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConf {
    fn default() -> StoreConf {
        StoreConf {
            redis_url: StoreConf::default_redis_url(),
        }
    }
}

impl StoreConf {
    fn default_redis_url() -> String {
        "redis://localhost:6379/0".into()
    }
}

/// Performance knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConf {
    /// Rows handled per batch by the default handlers.
    #[serde(default = "PerformanceConf::default_batch_size")]
    pub batch_size: usize,

    /// Tasks executing concurrently across the process.
    #[serde(default = "PerformanceConf::default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Per-task execution budget, in seconds.
    #[serde(default = "PerformanceConf::default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
}

impl Default for PerformanceConf {
    fn default() -> PerformanceConf {
        PerformanceConf {
            batch_size: PerformanceConf::default_batch_size(),
            max_concurrent_tasks: PerformanceConf::default_max_concurrent_tasks(),
            task_timeout_seconds: PerformanceConf::default_task_timeout_seconds(),
        }
    }
}

impl PerformanceConf {
    fn default_batch_size() -> usize {
        1000
    }

    fn default_max_concurrent_tasks() -> usize {
        10
    }

    fn default_task_timeout_seconds() -> u64 {
        300
    }
}

/// Health loop and backpressure monitoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConf {
    /// Disable to skip the health loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between health loop runs.
    #[serde(default = "MonitoringConf::default_health_check_interval")]
    pub health_check_interval: u64,

    /// Task failure ratio above which the health loop warns.
    #[serde(default = "MonitoringConf::default_task_failure_ratio")]
    pub task_failure_ratio: f64,

    /// Queue depth above which event intake slows down.
    #[serde(default = "MonitoringConf::default_queue_high_water")]
    pub queue_high_water: u64,

    /// Cap, in seconds, on the backpressure wait.
    #[serde(default = "MonitoringConf::default_backpressure_max_wait")]
    pub backpressure_max_wait: u64,
}

impl Default for MonitoringConf {
    fn default() -> MonitoringConf {
        MonitoringConf {
            enabled: true,
            health_check_interval: MonitoringConf::default_health_check_interval(),
            task_failure_ratio: MonitoringConf::default_task_failure_ratio(),
            queue_high_water: MonitoringConf::default_queue_high_water(),
            backpressure_max_wait: MonitoringConf::default_backpressure_max_wait(),
        }
    }
}

impl MonitoringConf {
    fn default_health_check_interval() -> u64 {
        30
    }

    fn default_task_failure_ratio() -> f64 {
        0.1
    }

    fn default_queue_high_water() -> u64 {
        10000
    }

    fn default_backpressure_max_wait() -> u64 {
        30
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::Conf;
    use super::SourceFailurePolicy;
    use super::SyncMode;
    use tributary_tasks::BackendKind;

    #[test]
    fn minimal_document_fills_defaults() {
        let conf: Conf = serde_json::from_value(serde_json::json!({
            "name": "plane",
        }))
        .unwrap();
        assert_eq!(conf.mode, SyncMode::Hybrid);
        assert!(conf.connect.enabled);
        assert!(conf.connect.sources.is_empty());
        assert!(conf.tasks.enabled);
        assert_eq!(conf.tasks.manager.default_backend, BackendKind::Queue);
        assert_eq!(conf.store.redis_url, "redis://localhost:6379/0");
        assert_eq!(conf.performance.max_concurrent_tasks, 10);
        assert_eq!(conf.monitoring.health_check_interval, 30);
        assert_eq!(conf.on_source_failure, SourceFailurePolicy::Continue);
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let result: Result<Conf, _> = serde_json::from_value(serde_json::json!({
            "name": "plane",
            "shiny": true,
        }));
        assert!(result.is_err());
    }

    #[test]
    fn full_document() {
        let conf: Conf = serde_json::from_value(serde_json::json!({
            "name": "plane",
            "mode": "cdc_only",
            "connect": {
                "enabled": true,
                "sources": [{
                    "name": "orders",
                    "family": "mysql",
                    "topic_prefix": "cdc",
                    "hostname": "db.internal",
                    "user": "captor",
                    "password": "secret",
                    "database": "shop",
                    "tables": ["orders"],
                }],
            },
            "tasks": {
                "manager": {
                    "default_backend": "local",
                },
            },
            "monitoring": { "queue_high_water": 500 },
            "on_source_failure": "stop",
        }))
        .unwrap();
        assert_eq!(conf.mode, SyncMode::CdcOnly);
        assert_eq!(conf.connect.sources.len(), 1);
        assert_eq!(conf.tasks.manager.default_backend, BackendKind::Local);
        assert_eq!(conf.monitoring.queue_high_water, 500);
        assert_eq!(conf.on_source_failure, SourceFailurePolicy::Stop);
    }
}
