//! Status report surfaced by the coordinator.
use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use tributary_conf::SyncMode;
use tributary_healthcheck::HealthResults;
use tributary_queue::QueueStats;
use tributary_source::SourceStats;
use tributary_tasks::TaskStats;

/// Comprehensive status of the sync plane.
#[derive(Debug, Serialize)]
pub struct SyncStatus {
    pub name: String,
    pub mode: SyncMode,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub events_processed: u64,
    pub tasks_submitted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    pub throughput: Throughput,
    pub sources: Vec<SourceStats>,
    pub tasks: TaskStats,
    pub queues: HashMap<String, QueueStats>,
    pub health: HealthResults,
}

/// Uptime derived processing rates.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Throughput {
    pub events_per_second: f64,
    pub tasks_per_second: f64,
}

impl Throughput {
    /// Rates since the given start time; zero before the plane started.
    pub fn since(
        started_at: Option<DateTime<Utc>>,
        events_processed: u64,
        tasks_submitted: u64,
    ) -> Throughput {
        let runtime = started_at
            .map(|started| (Utc::now() - started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        if runtime <= 0.0 {
            return Throughput::default();
        }
        Throughput {
            events_per_second: events_processed as f64 / runtime,
            tasks_per_second: tasks_submitted as f64 / runtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::Throughput;

    #[test]
    fn rates_need_a_start_time() {
        let throughput = Throughput::since(None, 100, 100);
        assert_eq!(throughput.events_per_second, 0.0);
    }

    #[test]
    fn rates_scale_with_uptime() {
        let started = Utc::now() - chrono::Duration::seconds(10);
        let throughput = Throughput::since(Some(started), 100, 50);
        assert!(throughput.events_per_second > 5.0);
        assert!(throughput.events_per_second < 15.0);
        assert!(throughput.tasks_per_second > 2.5);
        assert!(throughput.tasks_per_second < 7.5);
    }
}
