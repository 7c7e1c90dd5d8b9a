//! Logical replication source over pglogical, broker free.
//!
//! The source manages publisher/subscriber lifecycle directly against
//! PostgreSQL: nodes, replication sets and subscriptions are created
//! idempotently, monitor loops watch subscription state and apply lag, and
//! replication conflicts surface as first class synthetic events.
mod config;
mod conflict;
mod controller;
mod error;
mod source;
mod types;

pub use self::config::PgLogicalConf;
pub use self::config::ReplicationMode;
pub use self::conflict::ConflictPolicy;
pub use self::conflict::ConflictRecord;
pub use self::conflict::ConflictResolver;
pub use self::conflict::ConflictType;
pub use self::controller::ReplicationController;
pub use self::error::ExtensionMissing;
pub use self::error::ProviderDsnRequired;
pub use self::source::PgLogicalSource;
pub use self::types::ReplicationNode;
pub use self::types::ReplicationSet;
pub use self::types::SlotInfo;
pub use self::types::SubscriptionStatus;
