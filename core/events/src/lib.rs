//! Canonical change event model and per-source checkpoints.
//!
//! Every capture source (broker-connect topics, logical replication) parses
//! its native change format into the [`ChangeEvent`] record defined here so
//! the rest of the plane never sees source specific envelopes.
mod change;
mod envelope;
mod error;

pub mod checkpoint;

pub use self::change::ChangeEvent;
pub use self::change::ChangeEventBuilder;
pub use self::change::EventPosition;
pub use self::change::Operation;
pub use self::change::Row;
pub use self::envelope::PayloadEnvelope;
pub use self::envelope::CONTENT_TYPE_JSON;
pub use self::envelope::SCHEMA_VERSION;
pub use self::error::MissingRowImage;
pub use self::error::UnsupportedSchemaVersion;
