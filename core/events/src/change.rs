//! The canonical record of a row-level change.
use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::MissingRowImage;

/// Row image as a map of column name to value.
pub type Row = BTreeMap<String, Value>;

/// Kind of row-level change captured from a source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Truncate,
    /// Row emitted by an initial snapshot rather than a live change.
    Read,
}

impl Operation {
    /// Operations other then TRUNCATE must carry at least one row image.
    fn requires_row_image(&self) -> bool {
        !matches!(self, Operation::Truncate)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Truncate => "truncate",
            Operation::Read => "read",
        };
        write!(fmt, "{}", name)
    }
}

/// Opaque structured cursor locating an event in its source stream.
///
/// Which fields are set depends on the source: broker-connect events carry
/// the topic/partition/offset triple plus any source native position, while
/// logical replication events carry the LSN.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// PostgreSQL WAL position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
    /// MySQL binlog file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// MySQL binlog position within `file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<i64>,
    /// Oracle system change number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
}

impl EventPosition {
    /// Position of a record within a broker topic.
    pub fn at_offset<S: Into<String>>(topic: S, partition: i32, offset: i64) -> EventPosition {
        EventPosition {
            topic: Some(topic.into()),
            partition: Some(partition),
            offset: Some(offset),
            ..EventPosition::default()
        }
    }

    /// Position of a record within the PostgreSQL WAL.
    pub fn at_lsn<S: Into<String>>(lsn: S) -> EventPosition {
        EventPosition {
            lsn: Some(lsn.into()),
            ..EventPosition::default()
        }
    }
}

/// Canonical record of a row-level change, immutable once emitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Globally unique identifier of this event.
    pub id: String,

    /// Kind of change the event describes.
    pub operation: Operation,

    /// Source database name, when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Source schema name, when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Source table the change applies to.
    pub table: String,

    /// Commit time reported by the source, or capture time as a fallback.
    pub timestamp: DateTime<Utc>,

    /// Row image before the change (DELETE and UPDATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,

    /// Row image after the change (INSERT and UPDATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,

    /// Cursor locating the event in its source stream.
    #[serde(default)]
    pub position: EventPosition,

    /// Source specific attributes (connector name, txn id, snapshot flag, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ChangeEvent {
    /// Start building a change event for the given operation and table.
    pub fn build<S: Into<String>>(operation: Operation, table: S) -> ChangeEventBuilder {
        ChangeEventBuilder {
            operation,
            table: table.into(),
            database: None,
            schema: None,
            timestamp: None,
            before: None,
            after: None,
            position: EventPosition::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// True if the event was synthesised by the plane itself (conflicts, lag warnings).
    pub fn is_synthetic(&self) -> bool {
        self.metadata.contains_key("event_type")
    }
}

/// Incrementally build a [`ChangeEvent`], enforcing model invariants.
pub struct ChangeEventBuilder {
    operation: Operation,
    table: String,
    database: Option<String>,
    schema: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    before: Option<Row>,
    after: Option<Row>,
    position: EventPosition,
    metadata: BTreeMap<String, Value>,
}

impl ChangeEventBuilder {
    pub fn database<S: Into<String>>(mut self, database: S) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn schema<S: Into<String>>(mut self, schema: S) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn before(mut self, row: Row) -> Self {
        self.before = Some(row);
        self
    }

    pub fn after(mut self, row: Row) -> Self {
        self.after = Some(row);
        self
    }

    pub fn position(mut self, position: EventPosition) -> Self {
        self.position = position;
        self
    }

    pub fn metadata<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Finalise the event, checking the row image invariant.
    ///
    /// INSERT, UPDATE, DELETE and READ events must carry at least one of
    /// `before` and `after`; TRUNCATE events may carry neither.
    pub fn finish(self) -> Result<ChangeEvent, MissingRowImage> {
        if self.operation.requires_row_image() && self.before.is_none() && self.after.is_none() {
            return Err(MissingRowImage::new(self.operation.to_string(), self.table));
        }
        let event = ChangeEvent {
            id: Uuid::new_v4().to_string(),
            operation: self.operation,
            database: self.database,
            schema: self.schema,
            table: self.table,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            before: self.before,
            after: self.after,
            position: self.position,
            metadata: self.metadata,
        };
        Ok(event)
    }
}
