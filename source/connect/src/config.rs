//! Configuration for a Connect managed CDC source.
use serde::Deserialize;
use serde::Serialize;

/// Upstream connector families supported by the source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorFamily {
    MySql,
    Postgres,
}

impl ConnectorFamily {
    /// Fully qualified class of the upstream connector.
    pub fn connector_class(&self) -> &'static str {
        match self {
            ConnectorFamily::MySql => "io.debezium.connector.mysql.MySqlConnector",
            ConnectorFamily::Postgres => "io.debezium.connector.postgresql.PostgreSqlConnector",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            ConnectorFamily::MySql => 3306,
            ConnectorFamily::Postgres => 5432,
        }
    }
}

/// Which operations the source emits; everything else is filtered.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperationFilter {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
    pub truncate: bool,
}

impl Default for OperationFilter {
    fn default() -> OperationFilter {
        OperationFilter {
            insert: true,
            update: true,
            delete: true,
            truncate: true,
        }
    }
}

/// Configuration for one Connect managed CDC source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectSourceConf {
    /// Identifier of the source; also keys the connector resource name and
    /// the consumer group.
    pub name: String,

    /// Upstream connector family.
    pub family: ConnectorFamily,

    /// Base URL of the Connect cluster REST API.
    #[serde(default = "ConnectSourceConf::default_connect_url")]
    pub connect_url: String,

    /// Comma separated broker addresses for the output topics.
    #[serde(default = "ConnectSourceConf::default_brokers")]
    pub brokers: String,

    /// Topic prefix configured on the connector.
    pub topic_prefix: String,

    /// Source database host.
    pub hostname: String,

    /// Source database port; family default when unset.
    #[serde(default)]
    pub port: Option<u16>,

    pub user: String,

    pub password: String,

    /// Source database name.
    pub database: String,

    /// Tables to capture; empty captures every table under the prefix.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Which operations the source emits.
    #[serde(default)]
    pub operations: OperationFilter,

    /// MySQL server ID; a stable default is derived from the name.
    #[serde(default)]
    pub server_id: Option<u32>,

    /// PostgreSQL replication slot; `tributary_{name}` when unset.
    #[serde(default)]
    pub slot_name: Option<String>,

    /// PostgreSQL publication; `tributary_pub_{name}` when unset.
    #[serde(default)]
    pub publication_name: Option<String>,

    /// Registry for Avro converters; JSON converters without it.
    #[serde(default)]
    pub schema_registry_url: Option<String>,

    #[serde(default = "ConnectSourceConf::default_snapshot_mode")]
    pub snapshot_mode: String,

    #[serde(default = "ConnectSourceConf::default_snapshot_locking_mode")]
    pub snapshot_locking_mode: String,

    #[serde(default = "ConnectSourceConf::default_tasks_max")]
    pub tasks_max: u32,

    #[serde(default = "ConnectSourceConf::default_max_batch_size")]
    pub max_batch_size: u32,

    #[serde(default = "ConnectSourceConf::default_max_queue_size")]
    pub max_queue_size: u32,

    #[serde(default = "ConnectSourceConf::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound, in seconds, on waiting for the connector to reach RUNNING.
    #[serde(default = "ConnectSourceConf::default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    /// Pause (not delete) the upstream connector when capture stops.
    #[serde(default = "ConnectSourceConf::default_pause_on_stop")]
    pub pause_on_stop: bool,
}

impl ConnectSourceConf {
    /// Name of the connector resource owned in the Connect cluster.
    pub fn connector_name(&self) -> String {
        format!("tributary-{}", self.name)
    }

    /// Stable consumer group derived from the source name.
    pub fn group_id(&self) -> String {
        format!("tributary-cdc-{}", self.name)
    }

    /// Database port, falling back to the family default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.family.default_port())
    }

    /// Output topics the connector produces for the configured tables.
    ///
    /// With no tables configured the source subscribes to every topic under
    /// the prefix via a pattern subscription.
    pub fn expected_topics(&self) -> Vec<String> {
        if self.tables.is_empty() {
            return vec![format!("^{}\\..*", regex_escape(&self.topic_prefix))];
        }
        self.tables
            .iter()
            .map(|table| format!("{}.{}.{}", self.topic_prefix, self.database, table))
            .collect()
    }

    /// True when the table passes the configured allow-list.
    pub fn captures_table(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|allowed| allowed == table)
    }

    fn default_connect_url() -> String {
        "http://localhost:8083".into()
    }

    fn default_brokers() -> String {
        "localhost:9092".into()
    }

    fn default_snapshot_mode() -> String {
        "initial".into()
    }

    fn default_snapshot_locking_mode() -> String {
        "minimal".into()
    }

    fn default_tasks_max() -> u32 {
        1
    }

    fn default_max_batch_size() -> u32 {
        2048
    }

    fn default_max_queue_size() -> u32 {
        8192
    }

    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_readiness_timeout_secs() -> u64 {
        60
    }

    fn default_pause_on_stop() -> bool {
        true
    }
}

/// Escape a literal for use inside a topic subscription pattern.
fn regex_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for character in literal.chars() {
        if "\\.+*?()|[]{}^$".contains(character) {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

#[cfg(test)]
pub(crate) fn fixture_conf(family: ConnectorFamily) -> ConnectSourceConf {
    ConnectSourceConf {
        name: "orders".into(),
        family,
        connect_url: ConnectSourceConf::default_connect_url(),
        brokers: ConnectSourceConf::default_brokers(),
        topic_prefix: "cdc".into(),
        hostname: "db.internal".into(),
        port: None,
        user: "captor".into(),
        password: "secret".into(),
        database: "shop".into(),
        tables: vec!["orders".into(), "order_lines".into()],
        operations: OperationFilter::default(),
        server_id: None,
        slot_name: None,
        publication_name: None,
        schema_registry_url: None,
        snapshot_mode: ConnectSourceConf::default_snapshot_mode(),
        snapshot_locking_mode: ConnectSourceConf::default_snapshot_locking_mode(),
        tasks_max: ConnectSourceConf::default_tasks_max(),
        max_batch_size: ConnectSourceConf::default_max_batch_size(),
        max_queue_size: ConnectSourceConf::default_max_queue_size(),
        poll_interval_ms: ConnectSourceConf::default_poll_interval_ms(),
        readiness_timeout_secs: ConnectSourceConf::default_readiness_timeout_secs(),
        pause_on_stop: ConnectSourceConf::default_pause_on_stop(),
    }
}

#[cfg(test)]
mod tests {
    use super::fixture_conf;
    use super::ConnectorFamily;

    #[test]
    fn topics_join_prefix_database_table() {
        let conf = fixture_conf(ConnectorFamily::MySql);
        assert_eq!(
            conf.expected_topics(),
            vec!["cdc.shop.orders", "cdc.shop.order_lines"]
        );
    }

    #[test]
    fn empty_tables_subscribe_by_pattern() {
        let mut conf = fixture_conf(ConnectorFamily::MySql);
        conf.tables.clear();
        assert_eq!(conf.expected_topics(), vec!["^cdc\\..*"]);
    }

    #[test]
    fn allow_list_filter() {
        let conf = fixture_conf(ConnectorFamily::Postgres);
        assert!(conf.captures_table("orders"));
        assert!(!conf.captures_table("audit_log"));
        let mut open = conf.clone();
        open.tables.clear();
        assert!(open.captures_table("anything"));
    }

    #[test]
    fn ports_default_by_family() {
        assert_eq!(fixture_conf(ConnectorFamily::MySql).port(), 3306);
        assert_eq!(fixture_conf(ConnectorFamily::Postgres).port(), 5432);
    }
}
