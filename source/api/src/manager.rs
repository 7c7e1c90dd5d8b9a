//! Supervision and fan-in for a set of capture sources.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use tributary_context::Context;

use crate::emitter::EventEmitter;
use crate::emitter::SourceCounters;
use crate::stream::EventStream;
use crate::Source;
use crate::SourceStats;

/// Default capacity of the fan-in channel.
///
/// A bounded channel is what lets the coordinator push backpressure into
/// the capture loops.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Supervises a set of sources and fans their events into one stream.
///
/// A source failing to start or dying mid-capture never stops its
/// siblings; the failure is logged and visible in the source statistics.
pub struct SourceManager {
    counters: HashMap<String, Arc<SourceCounters>>,
    receiver: Option<mpsc::Receiver<tributary_events::ChangeEvent>>,
    sender: mpsc::Sender<tributary_events::ChangeEvent>,
    sources: Vec<Box<dyn Source>>,
}

impl SourceManager {
    pub fn new() -> SourceManager {
        SourceManager::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Manager with a custom fan-in channel capacity.
    pub fn with_capacity(capacity: usize) -> SourceManager {
        let (sender, receiver) = mpsc::channel(capacity);
        SourceManager {
            counters: HashMap::new(),
            receiver: Some(receiver),
            sender,
            sources: Vec::new(),
        }
    }

    /// Add a source to supervise.
    pub fn register(&mut self, source: Box<dyn Source>) {
        self.counters
            .insert(source.name().to_string(), Arc::new(SourceCounters::default()));
        self.sources.push(source);
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Take the fan-in stream. Can only be taken once.
    pub fn events(&mut self) -> Option<EventStream> {
        self.receiver.take().map(EventStream::new)
    }

    /// Connect and start every registered source.
    ///
    /// Per-source failures are logged and skipped; the return value is how
    /// many sources are capturing afterwards.
    pub async fn start_all(&mut self, context: &Context) -> usize {
        let mut started = 0;
        for source in self.sources.iter_mut() {
            let name = source.name().to_string();
            let counters = self
                .counters
                .get(&name)
                .cloned()
                .unwrap_or_default();
            let emitter = EventEmitter::new(name.clone(), self.sender.clone(), counters);
            let context = context
                .derive_with(|builder| builder.log_values(slog::o!("source" => name.clone())));
            if let Err(error) = source.connect(&context).await {
                slog::error!(
                    context.logger, "Source failed to connect";
                    "source" => &name, "error" => %error,
                );
                continue;
            }
            match source.start_capture(&context, emitter).await {
                Ok(()) => {
                    slog::info!(context.logger, "Source capture started"; "source" => &name);
                    started += 1;
                }
                Err(error) => {
                    slog::error!(
                        context.logger, "Source failed to start capture";
                        "source" => &name, "error" => %error,
                    );
                }
            }
        }
        started
    }

    /// Stop capture on every source, logging failures.
    pub async fn stop_all(&mut self, context: &Context) {
        for source in self.sources.iter_mut() {
            let name = source.name().to_string();
            if let Err(error) = source.stop_capture(context).await {
                slog::warn!(
                    context.logger, "Source failed to stop cleanly";
                    "source" => &name, "error" => %error,
                );
            }
        }
    }

    /// Per-source activity statistics.
    pub fn stats(&self) -> Vec<SourceStats> {
        self.sources
            .iter()
            .map(|source| {
                let counters = self.counters.get(source.name());
                SourceStats {
                    name: source.name().to_string(),
                    running: source.running(),
                    events_emitted: counters
                        .map(|counters| counters.events_emitted())
                        .unwrap_or(0),
                    parse_errors: counters
                        .map(|counters| counters.parse_errors())
                        .unwrap_or(0),
                    last_event_at: counters.and_then(|counters| counters.last_event_at()),
                }
            })
            .collect()
    }

    /// True while at least one source is capturing.
    pub fn any_running(&self) -> bool {
        self.sources.iter().any(|source| source.running())
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        SourceManager::new()
    }
}

#[cfg(any(test, feature = "test-fixture"))]
pub(crate) mod fixture {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use anyhow::Result;

    use tributary_context::Context;
    use tributary_events::ChangeEvent;

    use crate::EventEmitter;
    use crate::Source;

    /// Source fixture emitting a fixed script of events on start.
    pub struct ScriptedSource {
        events: Vec<ChangeEvent>,
        fail_connect: bool,
        name: String,
        running: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        pub fn new<S: Into<String>>(name: S, events: Vec<ChangeEvent>) -> ScriptedSource {
            ScriptedSource {
                events,
                fail_connect: false,
                name: name.into(),
                running: Arc::new(AtomicBool::new(false)),
            }
        }

        /// A fixture that fails its connect step, for failure path tests.
        pub fn failing<S: Into<String>>(name: S) -> ScriptedSource {
            ScriptedSource {
                events: Vec::new(),
                fail_connect: true,
                name: name.into(),
                running: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait::async_trait]
    impl Source for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&mut self, _: &Context) -> Result<()> {
            if self.fail_connect {
                anyhow::bail!("scripted connection failure");
            }
            Ok(())
        }

        async fn start_capture(&mut self, context: &Context, emitter: EventEmitter) -> Result<()> {
            let events = std::mem::take(&mut self.events);
            let running = Arc::clone(&self.running);
            running.store(true, Ordering::SeqCst);
            let context = context.clone();
            tokio::spawn(async move {
                for event in events {
                    if emitter.emit(&context, event).await.is_err() {
                        break;
                    }
                }
                running.store(false, Ordering::SeqCst);
            });
            Ok(())
        }

        async fn stop_capture(&mut self, _: &Context) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use tributary_context::Context;
    use tributary_events::ChangeEvent;
    use tributary_events::Operation;

    use super::fixture::ScriptedSource;
    use super::SourceManager;
    use crate::stream::RecvTimeout;

    fn event(table: &str, value: i64) -> ChangeEvent {
        let mut row = std::collections::BTreeMap::new();
        row.insert("id".to_string(), json!(value));
        ChangeEvent::build(Operation::Insert, table)
            .after(row)
            .finish()
            .unwrap()
    }

    #[tokio::test]
    async fn fan_in_from_multiple_sources() {
        let context = Context::fixture();
        let mut manager = SourceManager::new();
        manager.register(Box::new(ScriptedSource::new(
            "alpha",
            vec![event("a", 1), event("a", 2)],
        )));
        manager.register(Box::new(ScriptedSource::new("beta", vec![event("b", 1)])));
        let mut stream = manager.events().unwrap();

        let started = manager.start_all(&context).await;
        assert_eq!(started, 2);

        let mut received = 0;
        while received < 3 {
            match stream.recv_timeout(Duration::from_secs(2)).await {
                RecvTimeout::Event(_) => received += 1,
                other => panic!("expected event, got {:?}", other),
            }
        }
        let stats = manager.stats();
        let total: u64 = stats.iter().map(|stat| stat.events_emitted).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_siblings() {
        let context = Context::fixture();
        let mut manager = SourceManager::new();
        manager.register(Box::new(ScriptedSource::failing("broken")));
        manager.register(Box::new(ScriptedSource::new("alpha", vec![event("a", 1)])));
        let mut stream = manager.events().unwrap();

        let started = manager.start_all(&context).await;
        assert_eq!(started, 1);
        match stream.recv_timeout(Duration::from_secs(2)).await {
            RecvTimeout::Event(event) => assert_eq!(event.table, "a"),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_distinguishes_idle_from_closed() {
        let context = Context::fixture();
        let mut manager = SourceManager::new();
        manager.register(Box::new(ScriptedSource::new("alpha", Vec::new())));
        let mut stream = manager.events().unwrap();
        manager.start_all(&context).await;

        // No events were scripted: a bounded wait times out while the
        // manager (and its senders) are alive.
        match stream.recv_timeout(Duration::from_millis(50)).await {
            RecvTimeout::TimedOut => {}
            other => panic!("expected timeout, got {:?}", other),
        }

        // Dropping the manager drops every sender; the stream reports
        // termination instead of timing out.
        drop(manager);
        match stream.recv_timeout(Duration::from_secs(1)).await {
            RecvTimeout::Closed => {}
            other => panic!("expected closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let mut manager = SourceManager::new();
        assert!(manager.events().is_some());
        assert!(manager.events().is_none());
    }
}
