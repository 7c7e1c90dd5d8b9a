//! Replication conflicts and their resolution policies.
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Kind of conflict recorded by the replication engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// An incoming insert hit an existing row.
    InsertExists,
    /// An incoming update found no row to update.
    UpdateMissing,
    /// An incoming delete found no row to delete.
    DeleteMissing,
    /// Concurrent updates to the same row.
    UpdateUpdate,
    /// A conflict kind this version does not model.
    #[serde(other)]
    Unknown,
}

impl ConflictType {
    /// Parse the conflict kind recorded in the conflict log.
    pub fn parse(raw: &str) -> ConflictType {
        match raw {
            "insert_exists" => ConflictType::InsertExists,
            "update_missing" => ConflictType::UpdateMissing,
            "delete_missing" => ConflictType::DeleteMissing,
            "update_update" => ConflictType::UpdateUpdate,
            _ => ConflictType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::InsertExists => "insert_exists",
            ConflictType::UpdateMissing => "update_missing",
            ConflictType::DeleteMissing => "delete_missing",
            ConflictType::UpdateUpdate => "update_update",
            ConflictType::Unknown => "unknown",
        }
    }
}

/// How conflicts on a subscription are resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The remote change wins.
    ApplyRemote,
    /// The local row wins.
    KeepLocal,
    /// The change with the newer commit timestamp wins.
    LastUpdateWins,
    /// The change with the older commit timestamp wins.
    FirstUpdateWins,
    /// Leave the conflict for an explicit resolution call.
    Manual,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ApplyRemote => "apply_remote",
            ConflictPolicy::KeepLocal => "keep_local",
            ConflictPolicy::LastUpdateWins => "last_update_wins",
            ConflictPolicy::FirstUpdateWins => "first_update_wins",
            ConflictPolicy::Manual => "manual",
        }
    }
}

impl Default for ConflictPolicy {
    fn default() -> ConflictPolicy {
        ConflictPolicy::ApplyRemote
    }
}

/// A conflict observed in the replication engine's log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflict log entry ID.
    pub id: String,

    /// Table the conflicting change applies to.
    pub table: String,

    pub conflict_type: ConflictType,

    /// Local row at conflict time, when the engine recorded one.
    #[serde(default)]
    pub local_tuple: Option<Value>,

    /// Incoming remote row, when the engine recorded one.
    #[serde(default)]
    pub remote_tuple: Option<Value>,

    /// Resolution recorded for the conflict; unresolved when absent.
    #[serde(default)]
    pub resolution: Option<String>,

    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Record a resolution on this in-memory copy.
    pub fn resolve<S: Into<String>>(&mut self, resolution: S) {
        self.resolution = Some(resolution.into());
        self.resolved_at = Some(Utc::now());
    }
}

/// Applies the declared policy to observed conflicts.
///
/// The replication engine performs the row level resolution for automatic
/// policies; the resolver's job is to classify and to decide whether a
/// conflict needs an operator.
#[derive(Clone, Copy, Debug)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> ConflictResolver {
        ConflictResolver { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Resolution to record automatically, or `None` to wait for an
    /// explicit `resolve_conflict` call.
    pub fn auto_resolution(&self) -> Option<&'static str> {
        match self.policy {
            ConflictPolicy::Manual => None,
            policy => Some(policy.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::ConflictPolicy;
    use super::ConflictRecord;
    use super::ConflictResolver;
    use super::ConflictType;

    fn record() -> ConflictRecord {
        ConflictRecord {
            id: "17".into(),
            table: "orders".into(),
            conflict_type: ConflictType::UpdateUpdate,
            local_tuple: Some(serde_json::json!({"id": 7, "v": "local"})),
            remote_tuple: Some(serde_json::json!({"id": 7, "v": "remote"})),
            resolution: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn auto_policies_resolve() {
        for policy in [
            ConflictPolicy::ApplyRemote,
            ConflictPolicy::KeepLocal,
            ConflictPolicy::LastUpdateWins,
            ConflictPolicy::FirstUpdateWins,
        ] {
            let resolver = ConflictResolver::new(policy);
            assert_eq!(resolver.auto_resolution(), Some(policy.as_str()));
        }
    }

    #[test]
    fn manual_policy_leaves_unresolved() {
        let resolver = ConflictResolver::new(ConflictPolicy::Manual);
        assert_eq!(resolver.auto_resolution(), None);
    }

    #[test]
    fn record_resolution() {
        let mut record = record();
        assert!(!record.is_resolved());
        record.resolve("apply_remote");
        assert!(record.is_resolved());
        assert_eq!(record.resolution.as_deref(), Some("apply_remote"));
        assert!(record.resolved_at.is_some());
    }

    #[test]
    fn conflict_type_parsing() {
        assert_eq!(
            ConflictType::parse("insert_exists"),
            ConflictType::InsertExists
        );
        assert_eq!(
            ConflictType::parse("update_update"),
            ConflictType::UpdateUpdate
        );
        assert_eq!(ConflictType::parse("who_knows"), ConflictType::Unknown);
    }
}
