//! Backends a task can be submitted to for execution.
use std::time::Duration;

use anyhow::Result;

use tributary_context::Context;

use crate::task::TaskEnvelope;
use crate::task::TaskPriority;

mod broker;
mod local;
mod queue;

pub use self::broker::BrokerTaskBackend;
pub use self::local::LocalExecutor;
pub use self::local::LocalTaskBackend;
pub use self::queue::QueueTaskBackend;

/// A task handed to a backend, with its delivery options.
#[derive(Clone, Debug)]
pub struct TaskSubmission {
    pub envelope: TaskEnvelope,
    pub priority: TaskPriority,
    pub delay: Option<Duration>,
    pub expires_in: Option<Duration>,
    pub max_retries: Option<u32>,
}

/// Operations implemented by task submission backends.
#[async_trait::async_trait]
pub trait TaskBackend: Send + Sync {
    /// Hand a task over to the backend for eventual execution.
    async fn submit(&self, context: &Context, submission: TaskSubmission) -> Result<()>;
}
