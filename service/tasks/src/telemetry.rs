//! Telemetry related to task submission and execution.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::CounterVec;
use prometheus::Opts;

/// Total number of task submissions, by task type and backend.
pub static SUBMIT_COUNT: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new("tributary_tasks_submit", "Total number of task submissions"),
        &["task_type", "backend"],
    )
    .expect("failed to initialise SUBMIT_COUNT counter")
});

/// Number of task submissions that resulted in error.
pub static SUBMIT_ERR: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "tributary_tasks_submit_errors",
            "Number of task submissions that resulted in error",
        ),
        &["task_type", "backend"],
    )
    .expect("failed to initialise SUBMIT_ERR counter")
});

/// Total number of task executions, by task type and outcome.
pub static EXECUTE_COUNT: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "tributary_tasks_execute",
            "Total number of task executions, by outcome",
        ),
        &["task_type", "outcome"],
    )
    .expect("failed to initialise EXECUTE_COUNT counter")
});

/// Number of queue payloads workers could not decode.
pub static DECODE_ERR: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "tributary_tasks_decode_errors",
            "Number of queue payloads workers could not decode",
        ),
        &["queue"],
    )
    .expect("failed to initialise DECODE_ERR counter")
});

/// Ensure metrics are registered only once.
static METRICS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// The first time this is called it registers the tasks metrics.
pub fn register_metrics(reg: &prometheus::Registry) -> Result<()> {
    if METRICS_REGISTERED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
        Box::new(SUBMIT_COUNT.clone()),
        Box::new(SUBMIT_ERR.clone()),
        Box::new(EXECUTE_COUNT.clone()),
        Box::new(DECODE_ERR.clone()),
    ];
    for collector in collectors {
        reg.register(collector)?;
    }
    Ok(())
}
