//! The real-time sync coordinator.
//!
//! Wires capture sources through the fan-in manager into the async task
//! plane: every change event received becomes a data-transform task, the
//! worker pools execute registered handlers against the durable queue, and
//! a periodic health loop watches the whole arrangement.
mod coordinator;
mod handlers;
mod status;

pub use self::coordinator::Dependencies;
pub use self::coordinator::SourceStartFailed;
pub use self::coordinator::SyncCoordinator;
pub use self::handlers::BatchProcessHandler;
pub use self::handlers::DataPullHandler;
pub use self::handlers::DataPushHandler;
pub use self::handlers::DataTransformHandler;
pub use self::status::SyncStatus;
pub use self::status::Throughput;
