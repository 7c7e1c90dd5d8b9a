//! Control objects of the replication topology.
use serde::Deserialize;
use serde::Serialize;

/// A pglogical node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationNode {
    pub name: String,
    pub dsn: String,
    pub is_local: bool,
}

/// A replication set and the tables it carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSet {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<String>,
}

/// Row reported by `pglogical.show_subscription_status()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub subscription_name: String,
    pub status: String,
    #[serde(default)]
    pub provider_node: Option<String>,
    #[serde(default)]
    pub slot_name: Option<String>,
    #[serde(default)]
    pub replication_sets: Option<Vec<String>>,
}

impl SubscriptionStatus {
    /// True while the subscription is applying changes.
    pub fn is_replicating(&self) -> bool {
        self.status == "replicating"
    }
}

/// Row reported by `pg_replication_slots` for pglogical slots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_name: String,
    pub plugin: String,
    pub active: bool,
    #[serde(default)]
    pub restart_lsn: Option<String>,
    #[serde(default)]
    pub confirmed_flush_lsn: Option<String>,
}

/// Apply progress reported by `pg_stat_subscription`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionProgress {
    #[serde(default)]
    pub received_lsn: Option<String>,
    #[serde(default)]
    pub latest_end_lsn: Option<String>,
    #[serde(default)]
    pub last_msg_receipt_time: Option<chrono::DateTime<chrono::Utc>>,
}
