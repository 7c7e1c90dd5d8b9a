//! Capture source interface and fan-in manager.
//!
//! A [`Source`] owns a connection to one upstream change feed (a set of
//! broker-connect topics, a logical replication subscription) and emits
//! canonical [`ChangeEvent`]s through an [`EventEmitter`]. The
//! [`SourceManager`] supervises a set of sources and fans their events into
//! a single [`EventStream`] for the sync coordinator.
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use tributary_context::Context;

mod emitter;
mod manager;
mod stream;

pub use self::emitter::EventEmitter;
pub use self::manager::SourceManager;
pub use self::stream::EventStream;
pub use self::stream::RecvTimeout;

#[cfg(any(test, feature = "test-fixture"))]
pub use self::manager::fixture::ScriptedSource;

/// A connector capturing changes from one upstream feed.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// Identifier of the source, unique within the process.
    fn name(&self) -> &str;

    /// Verify the upstream is reachable and prepare clients.
    async fn connect(&mut self, context: &Context) -> Result<()>;

    /// Begin capturing changes, emitting them through the emitter.
    ///
    /// Capture runs on background tasks owned by the source; this returns
    /// once capture is underway.
    async fn start_capture(&mut self, context: &Context, emitter: EventEmitter) -> Result<()>;

    /// Stop capture loops. Upstream resources (connectors, subscriptions,
    /// replication slots) are not dropped.
    async fn stop_capture(&mut self, context: &Context) -> Result<()>;

    /// True while the capture loops are running.
    fn running(&self) -> bool;
}

/// Point in time view of a source's activity.
#[derive(Clone, Debug, Serialize)]
pub struct SourceStats {
    /// Identifier of the source.
    pub name: String,

    /// True while the capture loops are running.
    pub running: bool,

    /// Events emitted since the process started.
    pub events_emitted: u64,

    /// Upstream records dropped because they could not be parsed.
    pub parse_errors: u64,

    /// Time the source last emitted an event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
}
