//! Asynchronous task submission, tracking and execution.
//!
//! Task management is divided into two halves:
//!
//! - Task submission: work derived from change events is submitted to a
//!   pluggable backend (the durable queue, an external broker topic, or an
//!   in-process channel).
//! - Task execution: worker pools receive submitted tasks and invoke the
//!   handler registered for each task type, acknowledging on success and
//!   negatively acknowledging on failure so the queue retry policy applies.
//!
//! The [`TaskManager`] ties the two halves together and tracks the
//! lifecycle, progress and results of every task it has seen.
mod backoff;
mod conf;
mod error;
mod handler;
mod manager;
mod progress;
mod task;
mod telemetry;
mod tracker;
mod worker;

pub mod backend;

pub use self::backoff::Backoff;
pub use self::conf::AckLevel;
pub use self::conf::BackoffConf;
pub use self::conf::BrokerConf;
pub use self::conf::TaskManagerConf;
pub use self::conf::WorkersConf;
pub use self::error::BackendUnavailable;
pub use self::error::HandlerAlreadyRegistered;
pub use self::error::NoHandlerRegistered;
pub use self::error::RetriesExceeded;
pub use self::error::UnknownTask;
pub use self::handler::HandlerRegistry;
pub use self::handler::ProgressReporter;
pub use self::handler::TaskHandler;
pub use self::manager::TaskManager;
pub use self::progress::ProgressUpdate;
pub use self::progress::TaskProgress;
pub use self::progress::TaskResult;
pub use self::task::BackendKind;
pub use self::task::SubmitOptions;
pub use self::task::TaskEnvelope;
pub use self::task::TaskInfo;
pub use self::task::TaskPriority;
pub use self::task::TaskStatus;
pub use self::task::TaskType;
pub use self::telemetry::register_metrics;
pub use self::tracker::TaskStats;
pub use self::tracker::TaskTracker;
pub use self::worker::WorkerPool;
