//! Errors reported by the async task framework.
use crate::task::BackendKind;

/// No handler is registered for a task type.
#[derive(Debug, thiserror::Error)]
#[error("no handler registered for task type '{0}'")]
pub struct NoHandlerRegistered(String);

impl NoHandlerRegistered {
    /// Report a task received for a type without a handler.
    pub fn new<S: Into<String>>(task_type: S) -> NoHandlerRegistered {
        NoHandlerRegistered(task_type.into())
    }
}

/// A handler is already registered for a task type.
#[derive(Debug, thiserror::Error)]
#[error("a handler is already registered for task type '{0}'")]
pub struct HandlerAlreadyRegistered(String);

impl HandlerAlreadyRegistered {
    /// Report a duplicate handler registration.
    pub fn new<S: Into<String>>(task_type: S) -> HandlerAlreadyRegistered {
        HandlerAlreadyRegistered(task_type.into())
    }
}

/// A task was submitted to a backend this process is not configured with.
#[derive(Debug, thiserror::Error)]
#[error("the '{0}' task backend is not configured for this process")]
pub struct BackendUnavailable(BackendKind);

impl BackendUnavailable {
    /// Report a submission against an unconfigured backend.
    pub fn new(kind: BackendKind) -> BackendUnavailable {
        BackendUnavailable(kind)
    }
}

/// Exceeded the maximum number of retries against the task store.
#[derive(Debug, thiserror::Error)]
#[error("exceeded maximum of {0} retries")]
pub struct RetriesExceeded(u16);

impl RetriesExceeded {
    /// Report the given number of retries was exceeded.
    pub fn new(max: u16) -> RetriesExceeded {
        RetriesExceeded(max)
    }
}

/// An operation referenced a task the manager has never seen.
#[derive(Debug, thiserror::Error)]
#[error("no task with ID '{0}' is known to this manager")]
pub struct UnknownTask(String);

impl UnknownTask {
    /// Report an operation against an unknown task ID.
    pub fn new<S: Into<String>>(task_id: S) -> UnknownTask {
        UnknownTask(task_id.into())
    }
}
