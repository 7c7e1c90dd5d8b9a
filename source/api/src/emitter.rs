//! Emitter handed to sources to publish canonical change events.
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use tokio::sync::mpsc;

use tributary_context::Context;
use tributary_events::ChangeEvent;

/// Per-source counters shared between the emitter and the manager.
#[derive(Default)]
pub(crate) struct SourceCounters {
    events_emitted: AtomicU64,
    parse_errors: AtomicU64,
    /// Millisecond epoch of the last emission; zero when none yet.
    last_event_ms: AtomicI64,
}

impl SourceCounters {
    pub(crate) fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }

    pub(crate) fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn last_event_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_event_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return None;
        }
        Utc.timestamp_millis_opt(ms).single()
    }
}

/// Publish canonical change events into the fan-in channel.
///
/// Cheap to clone; every capture loop of a source shares the same counters.
#[derive(Clone)]
pub struct EventEmitter {
    counters: Arc<SourceCounters>,
    sender: mpsc::Sender<ChangeEvent>,
    source: String,
}

impl EventEmitter {
    pub(crate) fn new(
        source: String,
        sender: mpsc::Sender<ChangeEvent>,
        counters: Arc<SourceCounters>,
    ) -> EventEmitter {
        EventEmitter {
            counters,
            sender,
            source,
        }
    }

    /// Publish an event, waiting if the fan-in channel is full.
    ///
    /// The emitting source is stamped into the event metadata so the
    /// fan-in consumer can attribute events after the merge. Waiting here
    /// is what propagates downstream backpressure into the capture loops.
    /// Fails only once the consuming side is gone.
    pub async fn emit(&self, context: &Context, mut event: ChangeEvent) -> Result<()> {
        event
            .metadata
            .entry("source".to_string())
            .or_insert_with(|| serde_json::Value::String(self.source.clone()));
        let event_id = event.id.clone();
        self.sender
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("change event stream consumer is gone"))?;
        self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_event_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        slog::trace!(
            context.logger, "Emitted change event";
            "source" => &self.source, "event" => event_id,
        );
        Ok(())
    }

    /// Record an upstream record dropped because it could not be parsed.
    pub fn record_parse_error(&self, context: &Context) {
        self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
        slog::debug!(
            context.logger, "Dropped unparseable upstream record";
            "source" => &self.source,
        );
    }

    /// Name of the source this emitter belongs to.
    pub fn source(&self) -> &str {
        &self.source
    }
}
