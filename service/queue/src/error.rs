//! Errors reported by the durable queue.

/// A message record could not be decoded from the store.
#[derive(Debug, thiserror::Error)]
#[error("could not decode the record for message '{0}'")]
pub struct MessageDecode(String);

impl MessageDecode {
    /// Report an undecodable record for the given message ID.
    pub fn new<S: Into<String>>(id: S) -> MessageDecode {
        MessageDecode(id.into())
    }
}

/// An operation referenced a queue the manager does not know about.
#[derive(Debug, thiserror::Error)]
#[error("no queue named '{0}' has been created")]
pub struct UnknownQueue(String);

impl UnknownQueue {
    /// Report an operation against an unknown queue.
    pub fn new<S: Into<String>>(name: S) -> UnknownQueue {
        UnknownQueue(name.into())
    }
}
