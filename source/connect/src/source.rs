//! The Connect managed capture source.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::Consumer;
use rdkafka::consumer::StreamConsumer;
use rdkafka::Message;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tributary_context::Context;
use tributary_source::EventEmitter;
use tributary_source::Source;

use crate::client::ConnectApiError;
use crate::client::ConnectClient;
use crate::config::ConnectSourceConf;
use crate::connector::build_connector_config;
use crate::envelope::parse_record;

/// Delay between connector status polls while waiting for readiness.
const READINESS_POLL: Duration = Duration::from_secs(2);

/// Attempts at control plane calls before giving up during start.
const CONTROL_PLANE_ATTEMPTS: u32 = 3;

/// The connector did not reach the RUNNING state within the deadline.
#[derive(Debug, thiserror::Error)]
#[error("connector '{connector}' did not reach RUNNING within {deadline_secs}s (last state: {last_state})")]
pub struct ConnectorNotReady {
    pub connector: String,
    pub deadline_secs: u64,
    pub last_state: String,
}

/// CDC source over a Connect managed upstream connector.
pub struct ConnectSource {
    client: Option<ConnectClient>,
    conf: ConnectSourceConf,
    consumer_task: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    shutdown: Option<watch::Sender<bool>>,
    topics: Vec<String>,
}

impl ConnectSource {
    pub fn new(conf: ConnectSourceConf) -> ConnectSource {
        ConnectSource {
            client: None,
            conf,
            consumer_task: None,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            topics: Vec::new(),
        }
    }

    fn client(&self) -> Result<&ConnectClient> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("connect source '{}' is not connected", self.conf.name))
    }

    /// Create or update the upstream connector resource, retrying
    /// transient control plane failures with a doubling delay.
    async fn ensure_connector(&self, context: &Context) -> Result<()> {
        let client = self.client()?;
        let name = self.conf.connector_name();
        let config = build_connector_config(&self.conf);
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match client.connector(&name).await {
                Ok(_) => client.update_config(&name, &config).await.map(|_| true),
                Err(error) => {
                    let missing = error
                        .downcast_ref::<ConnectApiError>()
                        .map(ConnectApiError::is_not_found)
                        .unwrap_or(false);
                    if missing {
                        client.create(&name, &config).await.map(|_| false)
                    } else {
                        Err(error)
                    }
                }
            };
            match outcome {
                Ok(updated) => {
                    let action = if updated { "Updated" } else { "Created" };
                    slog::info!(
                        context.logger, "{} upstream connector", action;
                        "connector" => &name,
                    );
                    return Ok(());
                }
                Err(error) if attempt < CONTROL_PLANE_ATTEMPTS => {
                    slog::warn!(
                        context.logger, "Control plane call failed, retrying";
                        "connector" => &name, "attempt" => attempt, "error" => %error,
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Poll the connector status until RUNNING or the readiness deadline.
    async fn wait_for_running(&self, context: &Context) -> Result<()> {
        let client = self.client()?;
        let name = self.conf.connector_name();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.conf.readiness_timeout_secs);
        let mut last_state = String::from("UNKNOWN");
        while tokio::time::Instant::now() < deadline {
            match client.status(&name).await {
                Ok(status) if status.is_running() => {
                    slog::info!(
                        context.logger, "Upstream connector is running";
                        "connector" => &name,
                    );
                    return Ok(());
                }
                Ok(status) => {
                    last_state = status.connector.state;
                }
                Err(error) => {
                    slog::warn!(
                        context.logger, "Failed to check connector status";
                        "connector" => &name, "error" => %error,
                    );
                }
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
        anyhow::bail!(ConnectorNotReady {
            connector: name,
            deadline_secs: self.conf.readiness_timeout_secs,
            last_state,
        })
    }

    fn build_consumer(&self) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.conf.brokers)
            .set("group.id", self.conf.group_id())
            .set("client.id", format!("tributary:cdc:{}", self.conf.name))
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .create()?;
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        Ok(consumer)
    }

    /// Consume the output topics until shutdown, parsing and emitting.
    async fn consume_loop(
        context: Context,
        conf: ConnectSourceConf,
        consumer: StreamConsumer,
        emitter: EventEmitter,
        running: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let record = tokio::select! {
                _ = shutdown.changed() => break,
                record = consumer.recv() => record,
            };
            let record = match record {
                Ok(record) => record,
                Err(error) => {
                    // The client reconnects on its own; poll errors here
                    // are transient and must not kill the source.
                    slog::warn!(
                        context.logger, "Consumer poll failed";
                        "source" => &conf.name, "error" => %error,
                    );
                    continue;
                }
            };
            let parsed = parse_record(
                &conf,
                record.topic(),
                record.partition(),
                record.offset(),
                record.payload(),
            );
            match parsed {
                Ok(Some(event)) => {
                    if emitter.emit(&context, event).await.is_err() {
                        // Consumer side is gone; the process is stopping.
                        break;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    slog::debug!(
                        context.logger, "Skipping malformed change record";
                        "source" => &conf.name,
                        "topic" => record.topic(),
                        "offset" => record.offset(),
                        "error" => %error,
                    );
                    emitter.record_parse_error(&context);
                }
            }
        }
        running.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Source for ConnectSource {
    fn name(&self) -> &str {
        &self.conf.name
    }

    /// Verify the control plane is reachable and compute the topic list.
    async fn connect(&mut self, context: &Context) -> Result<()> {
        let client = ConnectClient::new(&self.conf.connect_url);
        let existing = client.connectors().await?;
        slog::debug!(
            context.logger, "Connected to the connect cluster";
            "source" => &self.conf.name, "existing_connectors" => existing.len(),
        );
        self.topics = self.conf.expected_topics();
        self.client = Some(client);
        Ok(())
    }

    async fn start_capture(&mut self, context: &Context, emitter: EventEmitter) -> Result<()> {
        self.ensure_connector(context).await?;
        self.wait_for_running(context).await?;

        let consumer = self.build_consumer()?;
        let (shutdown, receiver) = watch::channel(false);
        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(ConnectSource::consume_loop(
            context.clone(),
            self.conf.clone(),
            consumer,
            emitter,
            Arc::clone(&self.running),
            receiver,
        ));
        self.shutdown = Some(shutdown);
        self.consumer_task = Some(task);
        Ok(())
    }

    /// Stop the consumer loop and pause (never delete) the connector.
    async fn stop_capture(&mut self, context: &Context) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.consumer_task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                slog::warn!(
                    context.logger, "Consumer loop did not stop within the deadline";
                    "source" => &self.conf.name,
                );
            }
        }
        self.running.store(false, Ordering::SeqCst);
        if self.conf.pause_on_stop {
            if let Ok(client) = self.client() {
                let name = self.conf.connector_name();
                if let Err(error) = client.pause(&name).await {
                    slog::warn!(
                        context.logger, "Failed to pause upstream connector";
                        "connector" => name, "error" => %error,
                    );
                }
            }
        }
        Ok(())
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
