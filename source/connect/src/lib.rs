//! CDC source consuming a Kafka Connect managed upstream (Debezium family).
//!
//! The source owns a named connector resource in an external Connect
//! cluster: it creates or updates the connector on start, waits for it to
//! reach the RUNNING state, then consumes the connector's output topics and
//! parses the native change envelopes into canonical change events.
mod client;
mod config;
mod connector;
mod envelope;
mod source;

pub use self::client::ConnectApiError;
pub use self::client::ConnectClient;
pub use self::client::ConnectorStatus;
pub use self::config::ConnectSourceConf;
pub use self::config::ConnectorFamily;
pub use self::config::OperationFilter;
pub use self::connector::build_connector_config;
pub use self::envelope::parse_record;
pub use self::envelope::EnvelopeError;
pub use self::source::ConnectSource;
pub use self::source::ConnectorNotReady;
