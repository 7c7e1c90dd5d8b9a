//! Task progress and result records.
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::task::TaskStatus;

/// Latest progress reported by a task handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub current_step: u64,
    pub total_steps: u64,
    pub processed_items: u64,
    pub total_items: u64,
    /// Completion estimate from items when known, steps otherwise.
    pub percentage: f64,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl TaskProgress {
    pub fn new<S: Into<String>>(task_id: S) -> TaskProgress {
        TaskProgress {
            task_id: task_id.into(),
            current_step: 0,
            total_steps: 1,
            processed_items: 0,
            total_items: 0,
            percentage: 0.0,
            message: String::new(),
            updated_at: Utc::now(),
        }
    }

    /// Fold an update into the progress and recompute the percentage.
    pub fn apply(&mut self, update: ProgressUpdate) {
        if let Some(current_step) = update.current_step {
            self.current_step = current_step;
        }
        if let Some(total_steps) = update.total_steps {
            self.total_steps = total_steps;
        }
        if let Some(processed_items) = update.processed_items {
            self.processed_items = processed_items;
        }
        if let Some(total_items) = update.total_items {
            self.total_items = total_items;
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        self.percentage = if self.total_items > 0 {
            (self.processed_items as f64 / self.total_items as f64) * 100.0
        } else if self.total_steps > 0 {
            (self.current_step as f64 / self.total_steps as f64) * 100.0
        } else {
            0.0
        };
        self.updated_at = Utc::now();
    }
}

/// Partial progress fields pushed by a handler.
#[derive(Clone, Debug, Default)]
pub struct ProgressUpdate {
    pub current_step: Option<u64>,
    pub total_steps: Option<u64>,
    pub processed_items: Option<u64>,
    pub total_items: Option<u64>,
    pub message: Option<String>,
}

/// Final outcome of a task execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl TaskResult {
    /// Result for a successfully completed task.
    pub fn success(
        task_id: String,
        result: Value,
        started_at: Option<DateTime<Utc>>,
    ) -> TaskResult {
        let completed_at = Utc::now();
        let duration_seconds = started_at
            .map(|started| (completed_at - started).num_milliseconds() as f64 / 1000.0);
        TaskResult {
            task_id,
            status: TaskStatus::Success,
            result: Some(result),
            error: None,
            started_at,
            completed_at,
            duration_seconds,
        }
    }

    /// Result for a failed task.
    pub fn failure(
        task_id: String,
        error: String,
        started_at: Option<DateTime<Utc>>,
    ) -> TaskResult {
        let completed_at = Utc::now();
        let duration_seconds = started_at
            .map(|started| (completed_at - started).num_milliseconds() as f64 / 1000.0);
        TaskResult {
            task_id,
            status: TaskStatus::Failure,
            result: None,
            error: Some(error),
            started_at,
            completed_at,
            duration_seconds,
        }
    }

    /// Result for a task revoked before completion.
    pub fn revoked(task_id: String) -> TaskResult {
        TaskResult {
            task_id,
            status: TaskStatus::Revoked,
            result: None,
            error: None,
            started_at: None,
            completed_at: Utc::now(),
            duration_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProgressUpdate;
    use super::TaskProgress;

    #[test]
    fn percentage_prefers_items() {
        let mut progress = TaskProgress::new("t1");
        progress.apply(ProgressUpdate {
            current_step: Some(1),
            total_steps: Some(4),
            processed_items: Some(25),
            total_items: Some(50),
            message: None,
        });
        assert_eq!(progress.percentage, 50.0);
    }

    #[test]
    fn percentage_falls_back_to_steps() {
        let mut progress = TaskProgress::new("t1");
        progress.apply(ProgressUpdate {
            current_step: Some(1),
            total_steps: Some(4),
            ..ProgressUpdate::default()
        });
        assert_eq!(progress.percentage, 25.0);
    }

    #[test]
    fn percentage_defaults_to_zero() {
        let mut progress = TaskProgress::new("t1");
        progress.apply(ProgressUpdate {
            total_steps: Some(0),
            ..ProgressUpdate::default()
        });
        assert_eq!(progress.percentage, 0.0);
    }

    #[test]
    fn latest_update_wins() {
        let mut progress = TaskProgress::new("t1");
        progress.apply(ProgressUpdate {
            processed_items: Some(10),
            total_items: Some(100),
            message: Some("first batch".into()),
            ..ProgressUpdate::default()
        });
        progress.apply(ProgressUpdate {
            processed_items: Some(90),
            message: Some("almost there".into()),
            ..ProgressUpdate::default()
        });
        assert_eq!(progress.processed_items, 90);
        assert_eq!(progress.percentage, 90.0);
        assert_eq!(progress.message, "almost there");
    }
}
