//! In-process registry of task lifecycle, progress and results.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::progress::ProgressUpdate;
use crate::progress::TaskProgress;
use crate::progress::TaskResult;
use crate::task::TaskInfo;
use crate::task::TaskStatus;

/// In-process registry of task lifecycle, progress and results.
///
/// Statistics are process local; cross process views come from the queue
/// statistics persisted with the store.
#[derive(Clone, Default)]
pub struct TaskTracker {
    state: Arc<Mutex<TrackerState>>,
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<String, TaskInfo>,
    progress: HashMap<String, TaskProgress>,
    results: HashMap<String, TaskResult>,
}

impl TaskTracker {
    pub fn new() -> TaskTracker {
        TaskTracker::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().expect("task tracker poisoned")
    }

    /// Record a newly submitted task.
    pub fn insert(&self, info: TaskInfo) {
        let mut state = self.lock();
        state
            .progress
            .insert(info.task_id.clone(), TaskProgress::new(info.task_id.clone()));
        state.active.insert(info.task_id.clone(), info);
    }

    /// Current status of a task, if the tracker has seen it.
    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let state = self.lock();
        state
            .active
            .get(task_id)
            .map(|info| info.status)
            .or_else(|| state.results.get(task_id).map(|result| result.status))
    }

    /// Latest progress reported for a task.
    pub fn progress(&self, task_id: &str) -> Option<TaskProgress> {
        let state = self.lock();
        state.progress.get(task_id).cloned()
    }

    /// Final result of a task, if it has completed.
    pub fn result(&self, task_id: &str) -> Option<TaskResult> {
        let state = self.lock();
        state.results.get(task_id).cloned()
    }

    /// Record the latest progress for a task.
    pub fn update_progress(&self, task_id: &str, update: ProgressUpdate) {
        let mut state = self.lock();
        if let Some(progress) = state.progress.get_mut(task_id) {
            progress.apply(update);
        }
    }

    /// Mark a task as picked up by a worker.
    pub fn mark_started(&self, task_id: &str) {
        let mut state = self.lock();
        if let Some(info) = state.active.get_mut(task_id) {
            info.status = TaskStatus::Started;
            info.started_at = Some(Utc::now());
        }
    }

    /// Mark a task as scheduled for redelivery after a failure.
    pub fn mark_retry(&self, task_id: &str) {
        let mut state = self.lock();
        if let Some(info) = state.active.get_mut(task_id) {
            info.status = TaskStatus::Retry;
        }
    }

    /// Mark a task as revoked.
    ///
    /// Returns false if the task already reached a terminal state. A task
    /// that has started is still marked: the handler is allowed to finish
    /// but queued copies will not be dispatched.
    pub fn revoke(&self, task_id: &str) -> bool {
        let mut state = self.lock();
        match state.active.get_mut(task_id) {
            None => false,
            Some(info) => {
                info.status = TaskStatus::Revoked;
                true
            }
        }
    }

    /// True if the task was revoked before or during execution.
    pub fn is_revoked(&self, task_id: &str) -> bool {
        let state = self.lock();
        state
            .active
            .get(task_id)
            .map(|info| info.status == TaskStatus::Revoked)
            .unwrap_or(false)
    }

    /// Record a successful execution and retire the task.
    pub fn complete(&self, task_id: &str, result: Value) {
        let mut state = self.lock();
        let started_at = state
            .active
            .get(task_id)
            .and_then(|info| info.started_at);
        let result = TaskResult::success(task_id.to_string(), result, started_at);
        state.results.insert(task_id.to_string(), result);
        state.active.remove(task_id);
    }

    /// Record a failed execution and retire the task.
    pub fn fail(&self, task_id: &str, error: String) {
        let mut state = self.lock();
        let started_at = state
            .active
            .get(task_id)
            .and_then(|info| info.started_at);
        let result = TaskResult::failure(task_id.to_string(), error, started_at);
        state.results.insert(task_id.to_string(), result);
        state.active.remove(task_id);
    }

    /// Record a revocation that prevented execution and retire the task.
    pub fn retire_revoked(&self, task_id: &str) {
        let mut state = self.lock();
        state
            .results
            .insert(task_id.to_string(), TaskResult::revoked(task_id.to_string()));
        state.active.remove(task_id);
    }

    /// Tasks still in an active state, with their progress.
    pub fn active_tasks(&self) -> Vec<(TaskInfo, TaskProgress)> {
        let state = self.lock();
        state
            .active
            .values()
            .filter(|info| info.status.is_active())
            .map(|info| {
                let progress = state
                    .progress
                    .get(&info.task_id)
                    .cloned()
                    .unwrap_or_else(|| TaskProgress::new(info.task_id.clone()));
                (info.clone(), progress)
            })
            .collect()
    }

    /// Aggregate counts over everything the tracker has seen.
    pub fn stats(&self) -> TaskStats {
        let state = self.lock();
        let mut stats = TaskStats {
            total_tasks: (state.active.len() + state.results.len()) as u64,
            active_tasks: state
                .active
                .values()
                .filter(|info| info.status.is_active())
                .count() as u64,
            ..TaskStats::default()
        };
        for info in state.active.values() {
            *stats
                .by_type
                .entry(info.task_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_backend
                .entry(info.backend.to_string())
                .or_insert(0) += 1;
            *stats
                .by_status
                .entry(format!("{:?}", info.status))
                .or_insert(0) += 1;
        }
        for result in state.results.values() {
            match result.status {
                TaskStatus::Success => stats.completed_tasks += 1,
                TaskStatus::Failure => stats.failed_tasks += 1,
                _ => {}
            }
            *stats
                .by_status
                .entry(format!("{:?}", result.status))
                .or_insert(0) += 1;
        }
        stats
    }

    /// Prune results (and their progress) completed before the horizon.
    ///
    /// Returns how many records were removed.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut state = self.lock();
        let stale: Vec<String> = state
            .results
            .iter()
            .filter(|(_, result)| result.completed_at < cutoff)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in &stale {
            state.results.remove(task_id);
            state.progress.remove(task_id);
        }
        // Terminal tasks stuck in the active map (revoked before dispatch)
        // age out on the same horizon.
        let stuck: Vec<String> = state
            .active
            .iter()
            .filter(|(_, info)| !info.status.is_active() && info.submitted_at < cutoff)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in &stuck {
            state.active.remove(task_id);
            state.progress.remove(task_id);
        }
        stale.len() + stuck.len()
    }

    /// Expiry timestamp recorded for a task, if any.
    pub fn expires_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        let state = self.lock();
        state.active.get(task_id).and_then(|info| info.expires_at)
    }
}

/// Aggregate task counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total_tasks: u64,
    pub active_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_backend: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::TaskTracker;
    use crate::task::BackendKind;
    use crate::task::TaskInfo;
    use crate::task::TaskPriority;
    use crate::task::TaskStatus;
    use crate::task::TaskType;

    fn info(task_id: &str) -> TaskInfo {
        TaskInfo {
            task_id: task_id.into(),
            task_type: TaskType::DataTransform,
            args: Vec::new(),
            kwargs: Default::default(),
            priority: TaskPriority::Normal,
            backend: BackendKind::Local,
            delay_seconds: None,
            expires_at: None,
            max_retries: 3,
            metadata: Default::default(),
            submitted_at: Utc::now(),
            started_at: None,
            status: TaskStatus::Pending,
        }
    }

    #[test]
    fn lifecycle_success() {
        let tracker = TaskTracker::new();
        tracker.insert(info("t1"));
        assert_eq!(tracker.status("t1"), Some(TaskStatus::Pending));

        tracker.mark_started("t1");
        assert_eq!(tracker.status("t1"), Some(TaskStatus::Started));

        tracker.complete("t1", json!({"rows": 3}));
        assert_eq!(tracker.status("t1"), Some(TaskStatus::Success));
        let result = tracker.result("t1").unwrap();
        assert_eq!(result.result, Some(json!({"rows": 3})));
        let started = result.started_at.unwrap();
        assert!(started <= result.completed_at);
        assert!(result.duration_seconds.unwrap() >= 0.0);
    }

    #[test]
    fn revoke_before_start() {
        let tracker = TaskTracker::new();
        tracker.insert(info("t1"));
        assert!(tracker.revoke("t1"));
        assert!(tracker.is_revoked("t1"));
        assert_eq!(tracker.status("t1"), Some(TaskStatus::Revoked));
    }

    #[test]
    fn revoke_unknown_is_false() {
        let tracker = TaskTracker::new();
        assert!(!tracker.revoke("missing"));
    }

    #[test]
    fn stats_count_outcomes() {
        let tracker = TaskTracker::new();
        tracker.insert(info("t1"));
        tracker.insert(info("t2"));
        tracker.insert(info("t3"));
        tracker.complete("t1", serde_json::Value::Null);
        tracker.fail("t2", "boom".into());
        let stats = tracker.stats();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
    }

    #[test]
    fn cleanup_prunes_old_results() {
        let tracker = TaskTracker::new();
        tracker.insert(info("t1"));
        tracker.complete("t1", serde_json::Value::Null);
        // A zero horizon prunes everything completed before "now".
        std::thread::sleep(Duration::from_millis(5));
        let removed = tracker.cleanup(Duration::ZERO);
        assert_eq!(removed, 1);
        assert!(tracker.result("t1").is_none());
        assert!(tracker.progress("t1").is_none());
    }
}
