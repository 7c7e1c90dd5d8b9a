//! The logical replication capture source.
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tributary_context::Context;
use tributary_events::ChangeEvent;
use tributary_events::Operation;
use tributary_source::EventEmitter;
use tributary_source::Source;

use crate::config::PgLogicalConf;
use crate::config::ReplicationMode;
use crate::conflict::ConflictRecord;
use crate::conflict::ConflictResolver;
use crate::controller::ReplicationController;
use crate::error::ProviderDsnRequired;

/// Recent conflicts kept in memory for the status report.
const CONFLICT_MEMORY: usize = 100;

/// Logical replication capture source.
///
/// Capture itself happens inside PostgreSQL (the subscription applies
/// changes); this source manages the topology and runs two monitor loops,
/// a status loop (subscription state, slot activity, conflict log) and a
/// lag loop, both of which surface findings as synthetic change events.
pub struct PgLogicalSource {
    conf: PgLogicalConf,
    conflicts: Arc<Mutex<Vec<ConflictRecord>>>,
    controller: Option<Arc<ReplicationController>>,
    resolver: ConflictResolver,
    running: Arc<AtomicBool>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PgLogicalSource {
    pub fn new(conf: PgLogicalConf) -> PgLogicalSource {
        let resolver = ConflictResolver::new(conf.conflict_policy);
        PgLogicalSource {
            conf,
            conflicts: Arc::new(Mutex::new(Vec::new())),
            controller: None,
            resolver,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    fn controller(&self) -> Result<Arc<ReplicationController>> {
        self.controller
            .clone()
            .ok_or_else(|| anyhow::anyhow!("replication source '{}' is not connected", self.conf.name))
    }

    /// Conflicts observed since the process started, newest last.
    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts
            .lock()
            .expect("conflict memory poisoned")
            .clone()
    }

    /// Record a resolution for a conflict, in the engine log and in memory.
    pub async fn resolve_conflict(
        &self,
        context: &Context,
        conflict_id: &str,
        resolution: &str,
    ) -> Result<bool> {
        let controller = self.controller()?;
        let mut conflicts = self.conflicts.lock().expect("conflict memory poisoned");
        let record = conflicts
            .iter_mut()
            .find(|record| record.id == conflict_id);
        let record = match record {
            None => return Ok(false),
            Some(record) => record,
        };
        controller
            .mark_conflict_resolved(conflict_id, resolution)
            .await?;
        record.resolve(resolution);
        slog::info!(
            context.logger, "Resolved replication conflict";
            "conflict" => conflict_id, "resolution" => resolution,
        );
        Ok(true)
    }

    /// Aggregate view of the replication topology for status reports.
    pub async fn replication_info(&self) -> Result<Value> {
        let controller = self.controller()?;
        let status = controller.subscription_status().await?;
        let slots = controller.slots().await?;
        let progress = controller.subscription_progress().await?;
        let conflicts = self.recent_conflicts();
        let recent: Vec<&ConflictRecord> = conflicts.iter().rev().take(10).collect();
        Ok(json!({
            "mode": self.conf.mode,
            "node_name": self.conf.node_name,
            "subscription": status,
            "slots": slots,
            "progress": progress,
            "conflict_policy": self.conf.conflict_policy,
            "recent_conflicts": recent,
        }))
    }

    /// Periodic sweep: subscription state, slot activity, conflict log.
    async fn status_loop(
        context: Context,
        conf: PgLogicalConf,
        controller: Arc<ReplicationController>,
        resolver: ConflictResolver,
        conflicts: Arc<Mutex<Vec<ConflictRecord>>>,
        emitter: EventEmitter,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = Duration::from_secs(conf.sync_check_interval_secs);
        let watches_subscription = matches!(
            conf.mode,
            ReplicationMode::Subscriber | ReplicationMode::Bidirectional
        );
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if watches_subscription {
                match controller.subscription_status().await {
                    Ok(Some(status)) if !status.is_replicating() => {
                        slog::warn!(
                            context.logger, "Subscription is not replicating";
                            "subscription" => &status.subscription_name,
                            "status" => &status.status,
                        );
                        let event = synthetic_event(
                            "subscription_status",
                            "system",
                            [
                                ("subscription".into(), json!(status.subscription_name)),
                                ("status".into(), json!(status.status)),
                            ],
                        );
                        if emitter.emit(&context, event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(error) => slog::warn!(
                        context.logger, "Failed to check subscription status";
                        "error" => %error,
                    ),
                }
            }

            match controller.slots().await {
                Ok(slots) => {
                    for slot in slots.iter().filter(|slot| !slot.active) {
                        slog::warn!(
                            context.logger, "Replication slot is not active";
                            "slot" => &slot.slot_name,
                        );
                    }
                }
                Err(error) => slog::warn!(
                    context.logger, "Failed to list replication slots";
                    "error" => %error,
                ),
            }

            match controller.unresolved_conflicts(conf.conflict_batch_size).await {
                Ok(found) => {
                    for mut record in found {
                        if !seen.insert(record.id.clone()) {
                            continue;
                        }
                        // Auto policies are applied by the engine; record
                        // the disposition so the log converges. Manual
                        // leaves the row for resolve_conflict.
                        if let Some(resolution) = resolver.auto_resolution() {
                            let marked = controller
                                .mark_conflict_resolved(&record.id, resolution)
                                .await;
                            match marked {
                                Ok(()) => record.resolve(resolution),
                                Err(error) => slog::warn!(
                                    context.logger, "Failed to record conflict resolution";
                                    "conflict" => &record.id, "error" => %error,
                                ),
                            }
                        }
                        let event = conflict_event(&record);
                        {
                            let mut memory =
                                conflicts.lock().expect("conflict memory poisoned");
                            memory.push(record);
                            if memory.len() > CONFLICT_MEMORY {
                                let excess = memory.len() - CONFLICT_MEMORY;
                                memory.drain(..excess);
                            }
                        }
                        if emitter.emit(&context, event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => slog::warn!(
                    context.logger, "Failed to poll the conflict log";
                    "error" => %error,
                ),
            }
        }
    }

    /// Periodic apply lag measurement; crossing the threshold emits a
    /// synthetic event but never stops capture.
    async fn lag_loop(
        context: Context,
        conf: PgLogicalConf,
        controller: Arc<ReplicationController>,
        emitter: EventEmitter,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = Duration::from_secs(conf.lag_check_interval_secs);
        let threshold = conf.apply_delay_threshold_ms as f64;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match controller.apply_lag_ms().await {
                Ok(Some(lag_ms)) if lag_ms > threshold => {
                    slog::warn!(
                        context.logger, "Replication apply lag over threshold";
                        "lag_ms" => lag_ms, "threshold_ms" => threshold,
                    );
                    let event = synthetic_event(
                        "replication_lag",
                        "system",
                        [
                            ("lag_ms".into(), json!(lag_ms)),
                            ("threshold_ms".into(), json!(conf.apply_delay_threshold_ms)),
                        ],
                    );
                    if emitter.emit(&context, event).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(error) => slog::warn!(
                    context.logger, "Failed to measure apply lag";
                    "error" => %error,
                ),
            }
        }
    }
}

/// Build a synthetic change event carrying monitor findings.
///
/// Synthetic events have no row data; an empty after image keeps the
/// change event invariants satisfied.
fn synthetic_event<const N: usize>(
    event_type: &str,
    table: &str,
    metadata: [(String, Value); N],
) -> ChangeEvent {
    let mut builder = ChangeEvent::build(Operation::Update, table)
        .after(BTreeMap::new())
        .metadata("event_type", json!(event_type));
    for (key, value) in metadata {
        builder = builder.metadata(key, value);
    }
    builder
        .finish()
        .expect("synthetic events always carry an after image")
}

/// Build the synthetic event describing a conflict.
fn conflict_event(record: &ConflictRecord) -> ChangeEvent {
    let mut builder = ChangeEvent::build(Operation::Update, record.table.clone())
        .metadata("event_type", json!("conflict"))
        .metadata("conflict_id", json!(record.id))
        .metadata("conflict_type", json!(record.conflict_type.as_str()))
        .metadata("resolution", json!(record.resolution));
    let mut has_image = false;
    if let Some(local) = record.local_tuple.as_ref().and_then(row_from_value) {
        builder = builder.before(local);
        has_image = true;
    }
    if let Some(remote) = record.remote_tuple.as_ref().and_then(row_from_value) {
        builder = builder.after(remote);
        has_image = true;
    }
    if !has_image {
        builder = builder.after(BTreeMap::new());
    }
    builder
        .finish()
        .expect("conflict events always carry an image")
}

fn row_from_value(value: &Value) -> Option<tributary_events::Row> {
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect(),
    )
}

#[async_trait::async_trait]
impl Source for PgLogicalSource {
    fn name(&self) -> &str {
        &self.conf.name
    }

    /// Open the pool, verify prerequisites and create the local node.
    async fn connect(&mut self, context: &Context) -> Result<()> {
        let controller = ReplicationController::connect(self.conf.clone()).await?;
        controller.verify_prerequisites(context).await?;
        controller.ensure_node(context).await?;
        self.controller = Some(Arc::new(controller));
        Ok(())
    }

    async fn start_capture(&mut self, context: &Context, emitter: EventEmitter) -> Result<()> {
        let controller = self.controller()?;
        match self.conf.mode {
            ReplicationMode::Publisher => {
                controller.ensure_replication_sets(context).await?;
                controller.add_tables(context).await?;
            }
            ReplicationMode::Subscriber => {
                let provider = self
                    .conf
                    .provider_dsn
                    .clone()
                    .ok_or_else(|| ProviderDsnRequired::new(&self.conf.name))?;
                controller.ensure_subscription(context, &provider).await?;
            }
            ReplicationMode::Bidirectional => {
                controller.ensure_replication_sets(context).await?;
                controller.add_tables(context).await?;
                let provider = self
                    .conf
                    .provider_dsn
                    .clone()
                    .ok_or_else(|| ProviderDsnRequired::new(&self.conf.name))?;
                controller.ensure_subscription(context, &provider).await?;
                controller.configure_conflict_handling(context).await?;
            }
        }

        let (shutdown, _) = watch::channel(false);
        self.running.store(true, Ordering::SeqCst);
        self.tasks.push(tokio::spawn(PgLogicalSource::status_loop(
            context.clone(),
            self.conf.clone(),
            Arc::clone(&controller),
            self.resolver,
            Arc::clone(&self.conflicts),
            emitter.clone(),
            shutdown.subscribe(),
        )));
        self.tasks.push(tokio::spawn(PgLogicalSource::lag_loop(
            context.clone(),
            self.conf.clone(),
            controller,
            emitter,
            shutdown.subscribe(),
        )));
        self.shutdown = Some(shutdown);
        slog::info!(
            context.logger, "Logical replication capture started";
            "source" => &self.conf.name,
        );
        Ok(())
    }

    /// Cancel the monitor loops; subscriptions and slots stay in place.
    async fn stop_capture(&mut self, context: &Context) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                slog::warn!(
                    context.logger, "Monitor loop did not stop within the deadline";
                    "source" => &self.conf.name,
                );
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use tributary_events::Operation;

    use super::conflict_event;
    use super::synthetic_event;
    use crate::conflict::ConflictRecord;
    use crate::conflict::ConflictType;

    #[test]
    fn synthetic_lag_event_shape() {
        let event = synthetic_event(
            "replication_lag",
            "system",
            [
                ("lag_ms".into(), json!(7500.0)),
                ("threshold_ms".into(), json!(5000)),
            ],
        );
        assert_eq!(event.table, "system");
        assert!(event.is_synthetic());
        assert_eq!(event.metadata["event_type"], json!("replication_lag"));
        assert_eq!(event.metadata["lag_ms"], json!(7500.0));
        assert_eq!(event.metadata["threshold_ms"], json!(5000));
    }

    #[test]
    fn conflict_event_carries_tuples() {
        let record = ConflictRecord {
            id: "17".into(),
            table: "orders".into(),
            conflict_type: ConflictType::UpdateUpdate,
            local_tuple: Some(json!({"id": 7, "v": "local"})),
            remote_tuple: Some(json!({"id": 7, "v": "remote"})),
            resolution: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        let event = conflict_event(&record);
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.table, "orders");
        assert_eq!(event.metadata["event_type"], json!("conflict"));
        assert_eq!(event.metadata["conflict_type"], json!("update_update"));
        assert_eq!(event.before.as_ref().unwrap()["v"], json!("local"));
        assert_eq!(event.after.as_ref().unwrap()["v"], json!("remote"));
    }

    #[test]
    fn conflict_event_without_tuples_still_valid() {
        let record = ConflictRecord {
            id: "18".into(),
            table: "orders".into(),
            conflict_type: ConflictType::DeleteMissing,
            local_tuple: None,
            remote_tuple: None,
            resolution: Some("apply_remote".into()),
            resolved_at: Some(Utc::now()),
            created_at: Utc::now(),
        };
        let event = conflict_event(&record);
        assert!(event.after.is_some());
        assert_eq!(event.metadata["resolution"], json!("apply_remote"));
    }
}
