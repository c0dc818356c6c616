//! Prometheus metrics for the pipeline.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `sluice_items_total` - Work items reported, by outcome status
//! - `sluice_worker_restarts_total` - Execution contexts torn down, by reason
//! - `sluice_jobs_finished_total` - Jobs finished, by final state
//!
//! ## Gauges
//! - `sluice_workers_in_flight` - Worker slots currently executing an item
//!
//! ## Histograms
//! - `sluice_item_duration_seconds` - Wall time per item, by outcome status
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for sluice metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `status`: outcome status (success, timeout, process_crash...)
pub static ITEMS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("sluice_items_total", "Total number of work items reported");
    CounterVec::new(opts, &["status"]).expect("sluice_items_total metric creation failed")
});

/// Labels:
/// - `reason`: why the context was torn down (timeout, crash, recycle, cancelled)
pub static WORKER_RESTARTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "sluice_worker_restarts_total",
        "Total number of execution contexts torn down",
    );
    CounterVec::new(opts, &["reason"]).expect("sluice_worker_restarts_total metric creation failed")
});

/// Labels:
/// - `state`: final job state (completed, completed_with_errors, failed)
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("sluice_jobs_finished_total", "Total number of jobs finished");
    CounterVec::new(opts, &["state"]).expect("sluice_jobs_finished_total metric creation failed")
});

pub static WORKERS_IN_FLIGHT: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "sluice_workers_in_flight",
        "Worker slots currently executing an item",
    )
    .expect("sluice_workers_in_flight metric creation failed")
});

/// Labels:
/// - `status`: outcome status
pub static ITEM_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "sluice_item_duration_seconds",
        "Work item wall time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"]).expect("sluice_item_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(ITEMS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(WORKER_RESTARTS_TOTAL.clone()),
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(WORKERS_IN_FLIGHT.clone()),
        Box::new(ITEM_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_item(status: &str, duration_secs: f64) {
    ITEMS_TOTAL.with_label_values(&[status]).inc();
    ITEM_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn record_worker_restart(reason: &str) {
    WORKER_RESTARTS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_job_finished(state: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[state]).inc();
}

pub fn worker_started() {
    WORKERS_IN_FLIGHT.inc();
}

pub fn worker_finished() {
    WORKERS_IN_FLIGHT.dec();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
