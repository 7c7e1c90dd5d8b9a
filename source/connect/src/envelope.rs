//! Parse native change envelopes into canonical change events.
use std::collections::BTreeMap;

use chrono::TimeZone;
use chrono::Utc;
use serde_json::Value;

use tributary_events::ChangeEvent;
use tributary_events::EventPosition;
use tributary_events::Operation;
use tributary_events::Row;

use crate::config::ConnectSourceConf;

/// Source envelope fields lifted into dedicated event fields; everything
/// else in the source block is preserved as metadata.
const LIFTED_SOURCE_FIELDS: &[&str] = &["db", "schema", "table", "ts_ms", "lsn", "file", "pos"];

/// An upstream record that cannot be mapped to a change event.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The record payload is not valid JSON.
    #[error("record payload is not valid JSON")]
    NotJson(#[from] serde_json::Error),

    /// The record is JSON but not a change envelope.
    #[error("record is not a change envelope: {0}")]
    Malformed(&'static str),

    /// The envelope carries an operation code this source cannot map.
    #[error("unknown operation code '{0}'")]
    UnknownOperation(String),
}

/// Parse one upstream record into a canonical change event.
///
/// Returns `Ok(None)` for records the configuration filters out (table not
/// in the allow-list, operation disabled). Tombstone records (no payload)
/// are also filtered.
pub fn parse_record(
    conf: &ConnectSourceConf,
    topic: &str,
    partition: i32,
    offset: i64,
    payload: Option<&[u8]>,
) -> Result<Option<ChangeEvent>, EnvelopeError> {
    let payload = match payload {
        // Tombstones mark compacted deletes; the delete event itself
        // already flowed through.
        None => return Ok(None),
        Some(payload) => payload,
    };
    let value: Value = serde_json::from_slice(payload)?;

    // Accept both bare envelopes (schemas.enable=false) and schema wrapped
    // ones, in case the connector converter was configured externally.
    let envelope = match (value.get("schema"), value.get("payload")) {
        (Some(_), Some(payload)) => payload,
        _ => &value,
    };
    if envelope.is_null() {
        return Ok(None);
    }

    let op = envelope
        .get("op")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::Malformed("missing op"))?;
    let (operation, snapshot) = match op {
        "c" => (Operation::Insert, false),
        "r" => (Operation::Insert, true),
        "u" => (Operation::Update, false),
        "d" => (Operation::Delete, false),
        "t" => (Operation::Truncate, false),
        other => return Err(EnvelopeError::UnknownOperation(other.to_string())),
    };

    let enabled = match operation {
        Operation::Insert | Operation::Read => conf.operations.insert,
        Operation::Update => conf.operations.update,
        Operation::Delete => conf.operations.delete,
        Operation::Truncate => conf.operations.truncate,
    };
    if !enabled {
        return Ok(None);
    }

    let source = envelope.get("source").cloned().unwrap_or(Value::Null);
    let table = match operation {
        // Truncate envelopes may omit the table on some connectors; fall
        // back to the topic suffix.
        Operation::Truncate => source
            .get("table")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| topic.rsplit('.').next().map(str::to_string))
            .ok_or(EnvelopeError::Malformed("missing table"))?,
        _ => source
            .get("table")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::Malformed("missing table"))?
            .to_string(),
    };
    if !conf.captures_table(&table) {
        return Ok(None);
    }

    let database = source.get("db").and_then(Value::as_str).map(str::to_string);
    let schema = source
        .get("schema")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| database.clone());

    let before = row_image(envelope.get("before"));
    let after = row_image(envelope.get("after"));

    let ts_ms = source
        .get("ts_ms")
        .and_then(Value::as_i64)
        .or_else(|| envelope.get("ts_ms").and_then(Value::as_i64));
    let timestamp = ts_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let position = EventPosition {
        topic: Some(topic.to_string()),
        partition: Some(partition),
        offset: Some(offset),
        lsn: scalar_to_string(source.get("lsn")),
        file: source
            .get("file")
            .and_then(Value::as_str)
            .map(str::to_string),
        pos: source.get("pos").and_then(Value::as_i64),
        scn: scalar_to_string(source.get("scn")),
        gtid: source
            .get("gtid")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    let mut builder = ChangeEvent::build(operation, table).timestamp(timestamp);
    if let Some(database) = database {
        builder = builder.database(database);
    }
    if let Some(schema) = schema {
        builder = builder.schema(schema);
    }
    if let Some(before) = before {
        builder = builder.before(before);
    }
    if let Some(after) = after {
        builder = builder.after(after);
    }
    builder = builder.position(position);
    if snapshot {
        builder = builder.metadata("snapshot", Value::Bool(true));
    }
    // Preserve the rest of the source block; unknown fields are kept so
    // downstream consumers never lose envelope information.
    if let Value::Object(fields) = source {
        for (key, value) in fields {
            if LIFTED_SOURCE_FIELDS.contains(&key.as_str()) || value.is_null() {
                continue;
            }
            builder = builder.metadata(key, value);
        }
    }

    let event = builder
        .finish()
        .map_err(|_| EnvelopeError::Malformed("missing row images"))?;
    Ok(Some(event))
}

fn row_image(value: Option<&Value>) -> Option<Row> {
    let object = value?.as_object()?;
    let row: Row = object
        .iter()
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();
    Some(row)
}

fn scalar_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(raw) => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;
    use serde_json::json;

    use tributary_events::Operation;

    use super::parse_record;
    use super::EnvelopeError;
    use crate::config::fixture_conf;
    use crate::config::ConnectorFamily;

    fn parse(
        value: serde_json::Value,
    ) -> Result<Option<tributary_events::ChangeEvent>, EnvelopeError> {
        let conf = fixture_conf(ConnectorFamily::Postgres);
        let payload = serde_json::to_vec(&value).unwrap();
        parse_record(&conf, "cdc.shop.orders", 0, 42, Some(&payload))
    }

    #[test]
    fn update_envelope() {
        let event = parse(json!({
            "op": "u",
            "before": { "id": 7, "v": "a" },
            "after": { "id": 7, "v": "b" },
            "source": { "table": "orders", "ts_ms": 1000, "lsn": "0/ABCD" },
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.table, "orders");
        assert_eq!(
            event.timestamp,
            Utc.timestamp_millis_opt(1000).single().unwrap()
        );
        assert_eq!(event.before.as_ref().unwrap()["v"], json!("a"));
        assert_eq!(event.after.as_ref().unwrap()["v"], json!("b"));
        assert_eq!(event.position.lsn.as_deref(), Some("0/ABCD"));
        assert_eq!(event.position.topic.as_deref(), Some("cdc.shop.orders"));
        assert_eq!(event.position.offset, Some(42));
    }

    #[test]
    fn snapshot_read_maps_to_insert_with_flag() {
        let event = parse(json!({
            "op": "r",
            "after": { "id": 1 },
            "source": { "table": "orders", "ts_ms": 5, "connector": "postgresql" },
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.metadata["snapshot"], json!(true));
        assert_eq!(event.metadata["connector"], json!("postgresql"));
    }

    #[test]
    fn delete_keeps_before_only() {
        let event = parse(json!({
            "op": "d",
            "before": { "id": 7 },
            "after": null,
            "source": { "table": "orders", "ts_ms": 5 },
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert!(event.before.is_some());
        assert!(event.after.is_none());
    }

    #[test]
    fn table_not_in_allow_list_is_filtered() {
        let filtered = parse(json!({
            "op": "c",
            "after": { "id": 1 },
            "source": { "table": "audit_log", "ts_ms": 5 },
        }))
        .unwrap();
        assert!(filtered.is_none());
    }

    #[test]
    fn disabled_operation_is_filtered() {
        let mut conf = fixture_conf(ConnectorFamily::Postgres);
        conf.operations.delete = false;
        let payload = serde_json::to_vec(&json!({
            "op": "d",
            "before": { "id": 7 },
            "source": { "table": "orders", "ts_ms": 5 },
        }))
        .unwrap();
        let filtered = parse_record(&conf, "cdc.shop.orders", 0, 1, Some(&payload)).unwrap();
        assert!(filtered.is_none());
    }

    #[test]
    fn missing_op_is_malformed() {
        let error = parse(json!({
            "before": { "id": 7 },
            "source": { "table": "orders" },
        }))
        .unwrap_err();
        assert!(matches!(error, EnvelopeError::Malformed("missing op")));
    }

    #[test]
    fn unparseable_payload_is_rejected() {
        let conf = fixture_conf(ConnectorFamily::Postgres);
        let error = parse_record(&conf, "cdc.shop.orders", 0, 1, Some(b"not-json")).unwrap_err();
        assert!(matches!(error, EnvelopeError::NotJson(_)));
    }

    #[test]
    fn tombstone_is_skipped() {
        let conf = fixture_conf(ConnectorFamily::Postgres);
        let skipped = parse_record(&conf, "cdc.shop.orders", 0, 1, None).unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn schema_wrapped_envelope_is_unwrapped() {
        let event = parse(json!({
            "schema": { "type": "struct" },
            "payload": {
                "op": "c",
                "after": { "id": 1 },
                "source": { "table": "orders", "ts_ms": 5 },
            },
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.operation, Operation::Insert);
    }

    #[test]
    fn mysql_binlog_position_fields() {
        let event = parse(json!({
            "op": "c",
            "after": { "id": 1 },
            "source": {
                "table": "orders",
                "ts_ms": 5,
                "file": "binlog.000042",
                "pos": 1337,
                "server_id": 184054,
                "gtid": "uuid:1-5",
            },
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.position.file.as_deref(), Some("binlog.000042"));
        assert_eq!(event.position.pos, Some(1337));
        assert_eq!(event.position.gtid.as_deref(), Some("uuid:1-5"));
        assert_eq!(event.metadata["server_id"], json!(184054));
    }

    #[test]
    fn unknown_source_fields_are_preserved() {
        let event = parse(json!({
            "op": "c",
            "after": { "id": 1 },
            "source": { "table": "orders", "ts_ms": 5, "sequence": "[\"1\",\"2\"]" },
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.metadata["sequence"], json!("[\"1\",\"2\"]"));
    }
}
