//! Per-source resume cursors.
//!
//! A checkpoint records the last position a source has durably handled
//! downstream. Checkpoints advance only after a worker confirms handling,
//! never on dequeue, so a crash between dequeue and handler completion
//! causes redelivery rather than loss.
use std::sync::Arc;

use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use tributary_context::Context;

use crate::change::EventPosition;

/// Resume cursor persisted for a single source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Source the cursor belongs to.
    pub source_id: String,

    /// Last cursor confirmed as durably handled.
    pub last_committed_cursor: EventPosition,

    /// Source timestamp of the last confirmed event.
    pub last_event_time: DateTime<Utc>,

    /// ID of the last confirmed event.
    pub last_event_id: String,
}

/// Handle to the checkpoint persistence backend.
#[derive(Clone)]
pub struct Checkpoints(Arc<dyn CheckpointBackend>);

impl Checkpoints {
    /// Fetch the persisted cursor for a source, if any.
    pub async fn load(&self, context: &Context, source_id: &str) -> Result<Option<SourcePosition>> {
        self.0.load(context, source_id).await
    }

    /// Persist the cursor for a source, replacing any previous value.
    pub async fn save(&self, context: &Context, position: &SourcePosition) -> Result<()> {
        self.0.save(context, position).await
    }
}

impl<T> From<T> for Checkpoints
where
    T: CheckpointBackend + 'static,
{
    fn from(value: T) -> Self {
        Checkpoints(Arc::new(value))
    }
}

/// Operations implemented by checkpoint persistence backends.
#[async_trait::async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Fetch the persisted cursor for a source, if any.
    async fn load(&self, context: &Context, source_id: &str) -> Result<Option<SourcePosition>>;

    /// Persist the cursor for a source, replacing any previous value.
    async fn save(&self, context: &Context, position: &SourcePosition) -> Result<()>;
}

/// Checkpoint backend persisting cursors to redis hashes.
///
/// Cursors are stored under `checkpoint:{source_id}` as a JSON document so
/// operators can inspect them directly.
pub struct RedisCheckpoints {
    client: redis::aio::ConnectionManager,
}

impl RedisCheckpoints {
    pub fn new(client: redis::aio::ConnectionManager) -> RedisCheckpoints {
        RedisCheckpoints { client }
    }

    fn key(source_id: &str) -> String {
        format!("checkpoint:{}", source_id)
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for RedisCheckpoints {
    async fn load(&self, _: &Context, source_id: &str) -> Result<Option<SourcePosition>> {
        let mut client = self.client.clone();
        let raw: Option<String> = redis::AsyncCommands::hget(
            &mut client,
            RedisCheckpoints::key(source_id),
            "position",
        )
        .await?;
        let position = raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;
        Ok(position)
    }

    async fn save(&self, _: &Context, position: &SourcePosition) -> Result<()> {
        let mut client = self.client.clone();
        let raw = serde_json::to_string(position)?;
        let () = redis::AsyncCommands::hset(
            &mut client,
            RedisCheckpoints::key(&position.source_id),
            "position",
            raw,
        )
        .await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-fixture"))]
pub use self::fixture::MemoryCheckpoints;

#[cfg(any(test, feature = "test-fixture"))]
mod fixture {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use anyhow::Result;

    use tributary_context::Context;

    use super::CheckpointBackend;
    use super::SourcePosition;

    /// In-memory checkpoint backend for unit tests.
    #[derive(Default)]
    pub struct MemoryCheckpoints {
        positions: Mutex<HashMap<String, SourcePosition>>,
    }

    impl MemoryCheckpoints {
        pub fn new() -> MemoryCheckpoints {
            MemoryCheckpoints::default()
        }
    }

    #[async_trait::async_trait]
    impl CheckpointBackend for MemoryCheckpoints {
        async fn load(&self, _: &Context, source_id: &str) -> Result<Option<SourcePosition>> {
            let positions = self.positions.lock().expect("checkpoints poisoned");
            Ok(positions.get(source_id).cloned())
        }

        async fn save(&self, _: &Context, position: &SourcePosition) -> Result<()> {
            let mut positions = self.positions.lock().expect("checkpoints poisoned");
            positions.insert(position.source_id.clone(), position.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tributary_context::Context;

    use super::Checkpoints;
    use super::MemoryCheckpoints;
    use super::SourcePosition;
    use crate::change::EventPosition;

    #[tokio::test]
    async fn save_then_load() {
        let context = Context::fixture();
        let checkpoints = Checkpoints::from(MemoryCheckpoints::new());
        let position = SourcePosition {
            source_id: "orders-cdc".into(),
            last_committed_cursor: EventPosition::at_offset("cdc.shop.orders", 0, 10),
            last_event_time: Utc::now(),
            last_event_id: "event-1".into(),
        };

        assert!(checkpoints
            .load(&context, "orders-cdc")
            .await
            .unwrap()
            .is_none());
        checkpoints.save(&context, &position).await.unwrap();
        let loaded = checkpoints.load(&context, "orders-cdc").await.unwrap();
        assert_eq!(loaded, Some(position));
    }

    #[tokio::test]
    async fn save_replaces_cursor() {
        let context = Context::fixture();
        let checkpoints = Checkpoints::from(MemoryCheckpoints::new());
        let mut position = SourcePosition {
            source_id: "orders-cdc".into(),
            last_committed_cursor: EventPosition::at_offset("cdc.shop.orders", 0, 10),
            last_event_time: Utc::now(),
            last_event_id: "event-1".into(),
        };
        checkpoints.save(&context, &position).await.unwrap();
        position.last_committed_cursor = EventPosition::at_offset("cdc.shop.orders", 0, 11);
        position.last_event_id = "event-2".into();
        checkpoints.save(&context, &position).await.unwrap();

        let loaded = checkpoints
            .load(&context, "orders-cdc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_event_id, "event-2");
        assert_eq!(loaded.last_committed_cursor.offset, Some(11));
    }
}
