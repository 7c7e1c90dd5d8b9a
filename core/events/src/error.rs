//! Errors from the change event model.

/// A change event is missing the row images its operation requires.
#[derive(Debug, thiserror::Error)]
#[error("a {operation} event on table '{table}' must carry a before or after row image")]
pub struct MissingRowImage {
    pub operation: String,
    pub table: String,
}

impl MissingRowImage {
    /// Report an event without the row images its operation requires.
    pub fn new<S1: Into<String>, S2: Into<String>>(operation: S1, table: S2) -> Self {
        Self {
            operation: operation.into(),
            table: table.into(),
        }
    }
}

/// A queue payload carries a schema version this process cannot decode.
#[derive(Debug, thiserror::Error)]
#[error("cannot decode payload envelope with schema version {found} (supported up to {supported})")]
pub struct UnsupportedSchemaVersion {
    pub found: u16,
    pub supported: u16,
}

impl UnsupportedSchemaVersion {
    /// Report an envelope from a newer (or unknown) schema.
    pub fn new(found: u16, supported: u16) -> Self {
        Self { found, supported }
    }
}
