//! Versioned wrapper for opaque payloads moving through the durable queue.
//!
//! Payloads carry a small header so consumers can detect and reject
//! incompatible producers instead of failing on decode.
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::UnsupportedSchemaVersion;

/// Envelope schema version written by this process.
pub const SCHEMA_VERSION: u16 = 1;

/// Content type for JSON encoded bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Versioned serialization envelope around queue payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    /// Version of the envelope schema the producer wrote.
    pub schema_version: u16,

    /// Media type of the body.
    pub content_type: String,

    /// The wrapped payload.
    pub body: Value,
}

impl PayloadEnvelope {
    /// Wrap a payload in the current envelope schema.
    pub fn wrap<P: Serialize>(payload: &P) -> anyhow::Result<PayloadEnvelope> {
        let body = serde_json::to_value(payload)?;
        Ok(PayloadEnvelope {
            schema_version: SCHEMA_VERSION,
            content_type: CONTENT_TYPE_JSON.to_string(),
            body,
        })
    }

    /// Decode the envelope body, rejecting incompatible schema versions.
    pub fn open<P: DeserializeOwned>(&self) -> anyhow::Result<P> {
        if self.schema_version > SCHEMA_VERSION {
            anyhow::bail!(UnsupportedSchemaVersion::new(
                self.schema_version,
                SCHEMA_VERSION,
            ));
        }
        let body = serde_json::from_value(self.body.clone())?;
        Ok(body)
    }

    /// Encode the envelope to bytes for the queue.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let encoded = serde_json::to_vec(self)?;
        Ok(encoded)
    }

    /// Decode an envelope from queue bytes.
    pub fn decode(raw: &[u8]) -> anyhow::Result<PayloadEnvelope> {
        let envelope = serde_json::from_slice(raw)?;
        Ok(envelope)
    }
}
