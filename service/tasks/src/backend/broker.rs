//! Task backend over an external broker.
//!
//! Tasks publish to one topic per task type (`{prefix}.{task_type}`) for an
//! external distributed worker fleet to consume. Delivery options ride in
//! record headers so consumers can honour eta and expiry.
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::FutureProducer;
use rdkafka::producer::FutureRecord;
use rdkafka::util::Timeout;

use tributary_context::Context;

use crate::conf::BrokerConf;

use super::TaskBackend;
use super::TaskSubmission;

/// Header carrying the task ID.
pub const HEADER_TASK_ID: &str = "task_id";

/// Header carrying the priority score.
pub const HEADER_PRIORITY: &str = "priority";

/// Header carrying the earliest execution time, as an epoch.
pub const HEADER_ETA: &str = "eta";

/// Header carrying the expiry time, as an epoch.
pub const HEADER_EXPIRES: &str = "expires";

/// Task backend over an external broker.
pub struct BrokerTaskBackend {
    conf: BrokerConf,
    producer: FutureProducer,
}

impl BrokerTaskBackend {
    pub fn new(conf: BrokerConf) -> Result<BrokerTaskBackend> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &conf.brokers)
            .set("client.id", &conf.client_id)
            .set("request.required.acks", conf.ack_level.as_rdkafka_option())
            .set("request.timeout.ms", conf.request_timeout_ms.to_string())
            // Tasks should reach the broker immediately, not sit in batches.
            .set("queue.buffering.max.ms", "0")
            .create()?;
        Ok(BrokerTaskBackend { conf, producer })
    }

    fn topic(&self, task_type: &str) -> String {
        format!("{}.{}", self.conf.topic_prefix, task_type)
    }
}

#[async_trait::async_trait]
impl TaskBackend for BrokerTaskBackend {
    async fn submit(&self, context: &Context, submission: TaskSubmission) -> Result<()> {
        let topic = self.topic(submission.envelope.task_type.as_str());
        let payload = serde_json::to_vec(&submission.envelope)?;
        let now = Utc::now();

        let mut headers = OwnedHeaders::new()
            .add(HEADER_TASK_ID, &submission.envelope.task_id)
            .add(HEADER_PRIORITY, &submission.priority.score().to_string());
        if let Some(delay) = submission.delay {
            let eta = now + chrono::Duration::from_std(delay).unwrap_or_default();
            headers = headers.add(HEADER_ETA, &eta.timestamp().to_string());
        }
        if let Some(expires_in) = submission.expires_in {
            let expires = now + chrono::Duration::from_std(expires_in).unwrap_or_default();
            headers = headers.add(HEADER_EXPIRES, &expires.timestamp().to_string());
        }

        let record: FutureRecord<String, Vec<u8>> = FutureRecord::to(&topic)
            .key(&submission.envelope.task_id)
            .payload(&payload)
            .headers(headers);
        let timeout = Timeout::After(Duration::from_millis(self.conf.request_timeout_ms));
        self.producer
            .send(record, timeout)
            .await
            .map_err(|(error, _)| error)?;
        slog::debug!(
            context.logger, "Submitted task to broker topic";
            "topic" => topic, "task" => &submission.envelope.task_id,
        );
        Ok(())
    }
}
