//! Redis backed durable queue structures.
//!
//! Key schema for a queue named `{name}`:
//!
//! - `queue:{name}`: primary list (fifo/lifo modes).
//! - `queue:{name}:priority`: primary sorted set (priority mode).
//! - `stream:{name}`: primary stream, consumer group `{name}_group`.
//! - `queue:{name}:delayed`: sorted set of gated messages by due epoch.
//! - `queue:{name}:processing`: sorted set of leased messages by lease expiry.
//! - `queue:{name}:failed`: dead letter set.
//! - `queue:{name}:stats`: hash of monotonic counters.
//! - `msg:{id}`: hash holding the message record and its priority score.
//!
//! Dequeue for the list and sorted set modes runs as a single server side
//! script: lease sweep, delayed migration, pop and lease insert cannot
//! interleave with other consumers. Stream mode relies on the consumer
//! group for pop atomicity.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Context as AnyhowContext;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadOptions;
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use redis::Script;

use crate::config::QueueConf;
use crate::config::QueueMode;
use crate::error::MessageDecode;
use crate::message::MessageStatus;
use crate::message::QueueMessage;
use crate::queue::QueueSizes;

use super::QueueBackend;
use super::QueueCounters;

/// Lease sweep, delayed migration, pop and lease insert in one atomic step.
///
/// KEYS: primary, delayed, processing. ARGV: now (epoch milliseconds),
/// lease expiry (epoch milliseconds), queue mode, record key prefix.
const DEQUEUE_SCRIPT: &str = r#"
local primary = KEYS[1]
local delayed = KEYS[2]
local processing = KEYS[3]
local now = tonumber(ARGV[1])
local lease = tonumber(ARGV[2])
local mode = ARGV[3]
local prefix = ARGV[4]

local function place(id)
  if mode == 'priority' then
    local priority = redis.call('HGET', prefix .. id, 'priority')
    redis.call('ZADD', primary, tonumber(priority or 0), id)
  elseif mode == 'lifo' then
    redis.call('LPUSH', primary, id)
  else
    redis.call('RPUSH', primary, id)
  end
end

local leaked = redis.call('ZRANGEBYSCORE', processing, 0, now)
for _, id in ipairs(leaked) do
  redis.call('ZREM', processing, id)
  place(id)
end

local due = redis.call('ZRANGEBYSCORE', delayed, 0, now)
for _, id in ipairs(due) do
  redis.call('ZREM', delayed, id)
  place(id)
end

local id
if mode == 'priority' then
  local popped = redis.call('ZPOPMAX', primary)
  if popped[1] then
    id = popped[1]
  end
else
  id = redis.call('LPOP', primary)
end
if not id then
  return false
end
redis.call('ZADD', processing, lease, id)
return id
"#;

/// Redis backed durable queue structures.
pub struct RedisBackend {
    client: ConnectionManager,
    conf: QueueConf,
    dequeue: Script,
    group_ready: AtomicBool,
    keys: QueueKeys,
}

struct QueueKeys {
    primary: String,
    delayed: String,
    processing: String,
    failed: String,
    stats: String,
    group: String,
}

impl QueueKeys {
    fn new(conf: &QueueConf) -> QueueKeys {
        let primary = match conf.mode {
            QueueMode::Priority => format!("queue:{}:priority", conf.name),
            QueueMode::Stream => format!("stream:{}", conf.name),
            _ => format!("queue:{}", conf.name),
        };
        QueueKeys {
            primary,
            delayed: format!("queue:{}:delayed", conf.name),
            processing: format!("queue:{}:processing", conf.name),
            failed: format!("queue:{}:failed", conf.name),
            stats: format!("queue:{}:stats", conf.name),
            group: format!("{}_group", conf.name),
        }
    }
}

impl RedisBackend {
    pub fn new(client: ConnectionManager, conf: QueueConf) -> RedisBackend {
        let keys = QueueKeys::new(&conf);
        RedisBackend {
            client,
            conf,
            dequeue: Script::new(DEQUEUE_SCRIPT),
            group_ready: AtomicBool::new(false),
            keys,
        }
    }

    fn record_key(id: &str) -> String {
        format!("msg:{}", id)
    }

    fn mode_arg(&self) -> &'static str {
        match self.conf.mode {
            QueueMode::Fifo => "fifo",
            QueueMode::Lifo => "lifo",
            QueueMode::Priority => "priority",
            QueueMode::Stream => "stream",
        }
    }

    async fn bump(&self, counter: &str) -> Result<()> {
        let mut client = self.client.clone();
        let _: i64 = client.hincr(&self.keys.stats, counter, 1i64).await?;
        Ok(())
    }

    async fn write_record(&self, message: &QueueMessage) -> Result<()> {
        let mut client = self.client.clone();
        let data = serde_json::to_string(message)?;
        let fields = [
            ("data", data),
            ("priority", message.priority.to_string()),
            ("created", message.created_at.timestamp().to_string()),
        ];
        let () = client
            .hset_multiple(RedisBackend::record_key(&message.id), &fields)
            .await?;
        match message.expires_at {
            Some(expires_at) => {
                let () = client
                    .expire_at(RedisBackend::record_key(&message.id), expires_at.timestamp())
                    .await?;
            }
            None => {
                let () = client
                    .expire(
                        RedisBackend::record_key(&message.id),
                        self.conf.default_ttl as i64,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn read_record(&self, id: &str) -> Result<Option<QueueMessage>> {
        let mut client = self.client.clone();
        let raw: Option<String> = client.hget(RedisBackend::record_key(id), "data").await?;
        let message = raw
            .map(|raw| serde_json::from_str(&raw).with_context(|| MessageDecode::new(id)))
            .transpose()?;
        Ok(message)
    }

    async fn set_status(&self, id: &str, status: MessageStatus) -> Result<Option<QueueMessage>> {
        let message = self.read_record(id).await?;
        let mut message = match message {
            None => return Ok(None),
            Some(message) => message,
        };
        message.status = status;
        self.write_record(&message).await?;
        Ok(Some(message))
    }

    /// Take for the list and sorted set modes: one script invocation.
    async fn take_scripted(&self) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let now = Utc::now().timestamp_millis();
        let lease = now + (self.conf.visibility_timeout as i64) * 1000;
        let id: Option<String> = self
            .dequeue
            .key(&self.keys.primary)
            .key(&self.keys.delayed)
            .key(&self.keys.processing)
            .arg(now)
            .arg(lease)
            .arg(self.mode_arg())
            .arg("msg:")
            .invoke_async(&mut client)
            .await?;
        Ok(id)
    }

    /// Take for stream mode: consumer group read plus lease bookkeeping.
    async fn take_stream(&self) -> Result<Option<String>> {
        let mut client = self.client.clone();
        self.ensure_group(&mut client).await?;
        let now = Utc::now().timestamp_millis();

        // Leaked leases are re-appended to the stream for redelivery.
        let leaked: Vec<String> = client
            .zrangebyscore(&self.keys.processing, 0i64, now)
            .await?;
        for id in leaked {
            let _: i64 = client.zrem(&self.keys.processing, &id).await?;
            let _: String = client
                .xadd(&self.keys.primary, "*", &[("msg_id", id.as_str())])
                .await?;
        }

        // Due delayed messages are appended to the stream as well.
        let due: Vec<String> = client.zrangebyscore(&self.keys.delayed, 0i64, now).await?;
        for id in due {
            let _: i64 = client.zrem(&self.keys.delayed, &id).await?;
            let _: String = client
                .xadd(&self.keys.primary, "*", &[("msg_id", id.as_str())])
                .await?;
        }

        let options = StreamReadOptions::default()
            .group(&self.keys.group, "tributary-consumer")
            .count(1);
        let reply: StreamReadReply = client
            .xread_options(&[&self.keys.primary], &[">"], &options)
            .await?;
        let entry = reply
            .keys
            .into_iter()
            .next()
            .and_then(|key| key.ids.into_iter().next());
        let entry = match entry {
            None => return Ok(None),
            Some(entry) => entry,
        };
        // The consumer group tracks the read; the lease set still guards
        // against consumer crashes after this point.
        let _: i64 = client
            .xack(&self.keys.primary, &self.keys.group, &[&entry.id])
            .await?;
        let id: Option<String> = entry.get("msg_id");
        if let Some(id) = id.as_ref() {
            let lease = now + (self.conf.visibility_timeout as i64) * 1000;
            let _: i64 = client.zadd(&self.keys.processing, id, lease).await?;
        }
        Ok(id)
    }

    async fn ensure_group(&self, client: &mut ConnectionManager) -> Result<()> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let created: redis::RedisResult<()> = client
            .xgroup_create_mkstream(&self.keys.primary, &self.keys.group, "0")
            .await;
        match created {
            Ok(()) => {}
            // Group already exists from a previous process.
            Err(error) if error.code() == Some("BUSYGROUP") => {}
            Err(error) => return Err(error.into()),
        }
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// IDs currently waiting in the primary structure.
    async fn primary_members(&self, client: &mut ConnectionManager) -> Result<Vec<String>> {
        let members = match self.conf.mode {
            QueueMode::Priority => client.zrange(&self.keys.primary, 0, -1).await?,
            QueueMode::Stream => Vec::new(),
            _ => client.lrange(&self.keys.primary, 0, -1).await?,
        };
        Ok(members)
    }
}

#[async_trait::async_trait]
impl QueueBackend for RedisBackend {
    async fn put(&self, message: &QueueMessage) -> Result<()> {
        let mut client = self.client.clone();
        self.write_record(message).await?;
        match message.delay_until {
            Some(delay_until) => {
                let _: i64 = client
                    .zadd(&self.keys.delayed, &message.id, delay_until.timestamp_millis())
                    .await?;
            }
            None => match self.conf.mode {
                QueueMode::Priority => {
                    let _: i64 = client
                        .zadd(&self.keys.primary, &message.id, message.priority)
                        .await?;
                }
                QueueMode::Lifo => {
                    let _: i64 = client.lpush(&self.keys.primary, &message.id).await?;
                }
                QueueMode::Fifo => {
                    let _: i64 = client.rpush(&self.keys.primary, &message.id).await?;
                }
                QueueMode::Stream => {
                    let _: String = client
                        .xadd(&self.keys.primary, "*", &[("msg_id", message.id.as_str())])
                        .await?;
                }
            },
        }
        self.bump("enqueued").await?;
        Ok(())
    }

    async fn take(&self) -> Result<Option<QueueMessage>> {
        let id = match self.conf.mode {
            QueueMode::Stream => self.take_stream().await?,
            _ => self.take_scripted().await?,
        };
        let id = match id {
            None => return Ok(None),
            Some(id) => id,
        };
        let message = self.set_status(&id, MessageStatus::Processing).await?;
        let message = match message {
            // Record evicted by TTL after placement; drop the stale lease.
            None => {
                let mut client = self.client.clone();
                let _: i64 = client.zrem(&self.keys.processing, &id).await?;
                return Ok(None);
            }
            Some(message) => message,
        };
        self.bump("dequeued").await?;
        Ok(Some(message))
    }

    async fn load(&self, id: &str) -> Result<Option<QueueMessage>> {
        self.read_record(id).await
    }

    async fn update(&self, message: &QueueMessage) -> Result<()> {
        self.write_record(message).await
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut client = self.client.clone();
        let _: i64 = client.zrem(&self.keys.processing, id).await?;
        if let Some(message) = self.read_record(id).await? {
            if message.status != MessageStatus::Completed {
                self.set_status(id, MessageStatus::Completed).await?;
                self.bump("completed").await?;
            }
        }
        Ok(())
    }

    async fn requeue(&self, message: &QueueMessage, delay_until: DateTime<Utc>) -> Result<()> {
        let mut client = self.client.clone();
        let _: i64 = client.zrem(&self.keys.processing, &message.id).await?;
        self.write_record(message).await?;
        let _: i64 = client
            .zadd(&self.keys.delayed, &message.id, delay_until.timestamp_millis())
            .await?;
        self.bump("retried").await?;
        Ok(())
    }

    async fn reject(&self, message: &QueueMessage) -> Result<()> {
        let mut client = self.client.clone();
        let _: i64 = client.zrem(&self.keys.processing, &message.id).await?;
        let _: i64 = client.zrem(&self.keys.delayed, &message.id).await?;
        self.write_record(message).await?;
        let _: i64 = client.sadd(&self.keys.failed, &message.id).await?;
        self.bump("failed").await?;
        Ok(())
    }

    async fn mark_expired(&self, message: &QueueMessage) -> Result<()> {
        let mut client = self.client.clone();
        let _: i64 = client.zrem(&self.keys.processing, &message.id).await?;
        self.set_status(&message.id, MessageStatus::Expired).await?;
        self.bump("expired").await?;
        Ok(())
    }

    async fn counters(&self) -> Result<QueueCounters> {
        let mut client = self.client.clone();
        let raw: std::collections::HashMap<String, u64> =
            client.hgetall(&self.keys.stats).await?;
        let fetch = |name: &str| raw.get(name).copied().unwrap_or(0);
        Ok(QueueCounters {
            enqueued: fetch("enqueued"),
            dequeued: fetch("dequeued"),
            completed: fetch("completed"),
            failed: fetch("failed"),
            retried: fetch("retried"),
            expired: fetch("expired"),
        })
    }

    async fn sizes(&self) -> Result<QueueSizes> {
        let mut client = self.client.clone();
        let primary_size: u64 = match self.conf.mode {
            QueueMode::Priority => client.zcard(&self.keys.primary).await?,
            QueueMode::Stream => client.xlen(&self.keys.primary).await?,
            _ => client.llen(&self.keys.primary).await?,
        };
        let processing_size: u64 = client.zcard(&self.keys.processing).await?;
        let delayed_size: u64 = client.zcard(&self.keys.delayed).await?;
        let dlq_size: u64 = client.scard(&self.keys.failed).await?;
        Ok(QueueSizes {
            primary_size,
            processing_size,
            delayed_size,
            dlq_size,
        })
    }

    async fn purge(&self) -> Result<u64> {
        let mut client = self.client.clone();
        let mut removed: Vec<String> = self.primary_members(&mut client).await?;
        let delayed: Vec<String> = client.zrange(&self.keys.delayed, 0, -1).await?;
        let failed: Vec<String> = client.smembers(&self.keys.failed).await?;
        removed.extend(delayed);
        removed.extend(failed);
        for id in &removed {
            let _: i64 = client.del(RedisBackend::record_key(id)).await?;
        }
        let keys = vec![
            self.keys.primary.clone(),
            self.keys.delayed.clone(),
            self.keys.failed.clone(),
        ];
        let _: i64 = client.del(keys).await?;
        Ok(removed.len() as u64)
    }
}
