//! Errors reported by the logical replication source.

/// The pglogical extension is not installed on the local database.
#[derive(Debug, thiserror::Error)]
#[error("the pglogical extension is not installed on '{0}'")]
pub struct ExtensionMissing(String);

impl ExtensionMissing {
    /// Report a database without the required extension.
    pub fn new<S: Into<String>>(database: S) -> ExtensionMissing {
        ExtensionMissing(database.into())
    }
}

/// Subscriber modes need a provider DSN to subscribe to.
#[derive(Debug, thiserror::Error)]
#[error("source '{0}' is configured as a subscriber but has no provider_dsn")]
pub struct ProviderDsnRequired(String);

impl ProviderDsnRequired {
    /// Report a subscriber configuration without a provider.
    pub fn new<S: Into<String>>(source: S) -> ProviderDsnRequired {
        ProviderDsnRequired(source.into())
    }
}
