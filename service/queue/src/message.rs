//! Messages held by a durable queue.
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Backoff cap applied to redelivery delays, in seconds.
const BACKOFF_CAP_SECS: u64 = 3600;

/// Base redelivery delay, in seconds.
const BACKOFF_BASE_SECS: u64 = 60;

/// Processing state of a queued message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Recorded and waiting to be delivered.
    Pending,
    /// Leased to a consumer, awaiting acknowledgement.
    Processing,
    /// Acknowledged as handled.
    Completed,
    /// Exhausted retries and moved to the dead letter set.
    Failed,
    /// Negatively acknowledged, scheduled for redelivery.
    Retrying,
    /// Passed its expiry before delivery; never handed to a consumer.
    Expired,
}

/// A message recorded in a durable queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Identifier of the message, unique within the store.
    pub id: String,

    /// Queue the message belongs to.
    pub queue_name: String,

    /// Opaque payload bytes, delivered exactly as enqueued.
    pub payload: Vec<u8>,

    /// Priority score; higher dequeues earlier in priority mode.
    #[serde(default)]
    pub priority: i64,

    /// Do not deliver before this wall clock time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,

    /// Do not deliver at or after this wall clock time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Redeliveries performed so far; never exceeds `max_retries`.
    #[serde(default)]
    pub retry_count: u32,

    /// Redeliveries allowed before the message is dead lettered.
    pub max_retries: u32,

    /// Time the message was recorded.
    pub created_at: DateTime<Utc>,

    /// Current processing state.
    pub status: MessageStatus,
}

impl QueueMessage {
    /// True once the message expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expiry| expiry <= now).unwrap_or(false)
    }
}

/// Options attached to a message at enqueue time.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Priority score; meaningful in priority mode, recorded in all modes.
    pub priority: i64,

    /// Hold the message in the delayed set for this long before delivery.
    pub delay: Option<Duration>,

    /// Expire the message this long after enqueue if not yet delivered.
    pub expires_in: Option<Duration>,

    /// Redelivery budget override; the queue default applies when unset.
    pub max_retries: Option<u32>,

    /// Caller chosen message ID; random when not provided.
    pub id: Option<String>,
}

/// Redelivery delay after the given number of retries.
///
/// Exponential from a 60 second base, capped at one hour.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let factor = 2u64.saturating_pow(retry_count.min(16));
    let delay = BACKOFF_BASE_SECS.saturating_mul(factor);
    Duration::from_secs(delay.min(BACKOFF_CAP_SECS))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::retry_backoff;
    use super::MessageStatus;
    use super::QueueMessage;

    #[test]
    fn backoff_schedule() {
        assert_eq!(retry_backoff(1), Duration::from_secs(120));
        assert_eq!(retry_backoff(2), Duration::from_secs(240));
        assert_eq!(retry_backoff(3), Duration::from_secs(480));
    }

    #[test]
    fn backoff_caps_at_one_hour() {
        assert_eq!(retry_backoff(6), Duration::from_secs(3600));
        assert_eq!(retry_backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn expiry_gate() {
        let now = Utc::now();
        let mut message = QueueMessage {
            id: "m1".into(),
            queue_name: "q".into(),
            payload: b"{}".to_vec(),
            priority: 0,
            delay_until: None,
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            status: MessageStatus::Pending,
        };
        assert!(!message.is_expired(now));
        message.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(message.is_expired(now));
    }

    #[test]
    fn record_round_trip_preserves_payload_bytes() {
        let payload = vec![0u8, 1, 2, 254, 255];
        let message = QueueMessage {
            id: "m1".into(),
            queue_name: "q".into(),
            payload: payload.clone(),
            priority: 5,
            delay_until: None,
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            status: MessageStatus::Pending,
        };
        let raw = serde_json::to_string(&message).unwrap();
        let decoded: QueueMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.payload, payload);
    }
}
