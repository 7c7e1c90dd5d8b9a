//! Build the upstream connector configuration map.
use std::collections::BTreeMap;

use crate::config::ConnectSourceConf;
use crate::config::ConnectorFamily;

/// Derive a stable MySQL server ID from the source name.
///
/// Debezium requires a server ID unique within the replication topology;
/// hashing the source name keeps restarts stable without configuration.
fn derived_server_id(name: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16777619);
    }
    // Keep clear of the small IDs real replicas tend to use.
    10000 + (hash % 1000000)
}

/// Build the connector configuration submitted to the Connect cluster.
pub fn build_connector_config(conf: &ConnectSourceConf) -> BTreeMap<String, String> {
    let mut config = BTreeMap::new();
    config.insert(
        "connector.class".into(),
        conf.family.connector_class().into(),
    );
    config.insert("tasks.max".into(), conf.tasks_max.to_string());
    config.insert("database.hostname".into(), conf.hostname.clone());
    config.insert("database.port".into(), conf.port().to_string());
    config.insert("database.user".into(), conf.user.clone());
    config.insert("database.password".into(), conf.password.clone());
    config.insert("topic.prefix".into(), conf.topic_prefix.clone());
    config.insert("snapshot.mode".into(), conf.snapshot_mode.clone());
    config.insert(
        "snapshot.locking.mode".into(),
        conf.snapshot_locking_mode.clone(),
    );
    config.insert("max.batch.size".into(), conf.max_batch_size.to_string());
    config.insert("max.queue.size".into(), conf.max_queue_size.to_string());
    config.insert("poll.interval.ms".into(), conf.poll_interval_ms.to_string());

    match conf.family {
        ConnectorFamily::MySql => {
            let server_id = conf
                .server_id
                .unwrap_or_else(|| derived_server_id(&conf.name));
            config.insert("database.server.id".into(), server_id.to_string());
            config.insert("database.include.list".into(), conf.database.clone());
            config.insert("binlog.buffer.size".into(), "32768".into());
        }
        ConnectorFamily::Postgres => {
            config.insert("database.dbname".into(), conf.database.clone());
            config.insert(
                "slot.name".into(),
                conf.slot_name
                    .clone()
                    .unwrap_or_else(|| format!("tributary_{}", conf.name)),
            );
            config.insert(
                "publication.name".into(),
                conf.publication_name
                    .clone()
                    .unwrap_or_else(|| format!("tributary_pub_{}", conf.name)),
            );
            config.insert("plugin.name".into(), "pgoutput".into());
        }
    }

    if !conf.tables.is_empty() {
        let include = match conf.family {
            ConnectorFamily::MySql => conf
                .tables
                .iter()
                .map(|table| format!("{}.{}", conf.database, table))
                .collect::<Vec<_>>()
                .join(","),
            ConnectorFamily::Postgres => conf
                .tables
                .iter()
                .map(|table| format!("public.{}", table))
                .collect::<Vec<_>>()
                .join(","),
        };
        config.insert("table.include.list".into(), include);
    }

    match conf.schema_registry_url.as_ref() {
        Some(registry) => {
            let converter = "io.confluent.connect.avro.AvroConverter";
            config.insert("key.converter".into(), converter.into());
            config.insert("value.converter".into(), converter.into());
            config.insert("key.converter.schema.registry.url".into(), registry.clone());
            config.insert(
                "value.converter.schema.registry.url".into(),
                registry.clone(),
            );
        }
        None => {
            let converter = "org.apache.kafka.connect.json.JsonConverter";
            config.insert("key.converter".into(), converter.into());
            config.insert("value.converter".into(), converter.into());
            config.insert("key.converter.schemas.enable".into(), "false".into());
            config.insert("value.converter.schemas.enable".into(), "false".into());
        }
    }

    config
}
