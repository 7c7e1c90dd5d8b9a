//! Telemetry for durable queue operations.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::CounterVec;
use prometheus::Opts;

/// Count of queue operations, by queue and operation.
pub static OPS_COUNT: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "tributary_queue_ops",
            "Count of queue operations, by queue and operation",
        ),
        &["queue", "op"],
    )
    .expect("failed to initialise OPS_COUNT counter")
});

/// Count of queue operations that resulted in error.
pub static OPS_ERR: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "tributary_queue_op_errors",
            "Count of queue operations that resulted in error",
        ),
        &["queue", "op"],
    )
    .expect("failed to initialise OPS_ERR counter")
});

/// Count of messages found expired at dequeue and never delivered.
pub static EXPIRED_COUNT: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "tributary_queue_expired",
            "Count of messages found expired at dequeue and never delivered",
        ),
        &["queue"],
    )
    .expect("failed to initialise EXPIRED_COUNT counter")
});

/// Ensure metrics are registered only once.
static METRICS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// The first time this is called it registers the queue metrics.
pub fn register_metrics(reg: &prometheus::Registry) -> Result<()> {
    if METRICS_REGISTERED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    let collectors: [Box<dyn prometheus::core::Collector>; 3] = [
        Box::new(OPS_COUNT.clone()),
        Box::new(OPS_ERR.clone()),
        Box::new(EXPIRED_COUNT.clone()),
    ];
    for collector in collectors {
        reg.register(collector)?;
    }
    Ok(())
}
