//! The [`Context`] is an immutable container for values scoped to an operation.
//!
//! Tributary processes run many concurrent activities: source capture loops,
//! queue workers, monitor loops, task handlers. Each of these operates within
//! a scope that carries values such as the decorated [`Logger`] to use.
//!
//! Contexts form a tree:
//!
//! - The root context represents the process-wide scope.
//! - Derived contexts narrow the scope and attach or update information
//!   (for example a logger annotated with the source name or task ID).
use slog::Logger;
use slog::OwnedKV;
use slog::SendSyncRefUnwindSafeKV;

/// Immutable container for values scoped to an operation.
///
/// Refer to the [crate level docs](crate) for details.
#[derive(Clone, Debug)]
pub struct Context {
    /// Logger with contextual attributes attached to it.
    pub logger: Logger,
}

impl Context {
    /// Initialise the root context for the process.
    pub fn root(logger: Logger) -> Context {
        Context { logger }
    }

    /// Derive a new [`Context`], attaching or updating values along the way.
    pub fn derive(&self) -> ContextBuilder {
        ContextBuilder {
            logger: self.logger.clone(),
        }
    }

    /// Derive a new [`Context`] with the changes applied by the callback.
    pub fn derive_with<F>(&self, callback: F) -> Context
    where
        F: FnOnce(ContextBuilder) -> ContextBuilder,
    {
        callback(self.derive()).build()
    }
}

/// Incrementally build a derived [`Context`].
pub struct ContextBuilder {
    logger: Logger,
}

impl ContextBuilder {
    /// Finalise the build process and return the new [`Context`].
    pub fn build(self) -> Context {
        Context {
            logger: self.logger,
        }
    }

    /// Attach log key/value pairs to the context logger.
    pub fn log_values<T>(mut self, entries: OwnedKV<T>) -> Self
    where
        T: SendSyncRefUnwindSafeKV + 'static,
    {
        self.logger = self.logger.new(entries);
        self
    }
}

#[cfg(any(test, feature = "test-fixture"))]
impl Context {
    /// Context that discards all logs, for use in tests.
    pub fn fixture() -> Context {
        let logger = Logger::root(slog::Discard, slog::o!());
        Context { logger }
    }
}
