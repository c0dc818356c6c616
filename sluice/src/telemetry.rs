//! Tracing spans and outcome recording for the pipeline.
//!
//! Every helper logs through `tracing` and, when the `metrics` feature is
//! enabled, also updates the Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use sluice::telemetry::{item_span, start_item_timer};
//!
//! let timer = start_item_timer();
//! let outcome = run(&item).instrument(item_span(job_id, &item.id, item.fetcher_id())).await;
//! record_item_outcome(job_id, &item.id, outcome.status, timer.elapsed_ms());
//! ```

use std::time::{Duration, Instant};

use tracing::{info_span, Span};

use crate::item::{ItemId, JobId};
use crate::outcome::OutcomeStatus;

/// Span covering one job from validation to completion.
#[must_use]
pub fn job_span(job_id: JobId) -> Span {
    info_span!("sluice.job", job_id = %job_id)
}

/// Span covering one work item inside a worker slot.
#[must_use]
pub fn item_span(job_id: JobId, item_id: &ItemId, fetcher_id: impl AsRef<str>) -> Span {
    info_span!(
        "sluice.item",
        job_id = %job_id,
        item_id = %item_id,
        fetcher_id = %fetcher_id.as_ref(),
    )
}

/// Span for the child side of the worker protocol.
#[must_use]
pub fn child_span(pid: u32) -> Span {
    info_span!("sluice.child", pid)
}

/// Record a reported outcome.
pub fn record_item_outcome(
    job_id: JobId,
    item_id: &ItemId,
    status: OutcomeStatus,
    elapsed_ms: u64,
) {
    if status.is_failure() {
        tracing::warn!(
            job_id = %job_id,
            item_id = %item_id,
            status = %status,
            elapsed_ms,
            "item finished with failure"
        );
    } else {
        tracing::debug!(
            job_id = %job_id,
            item_id = %item_id,
            status = %status,
            elapsed_ms,
            "item finished"
        );
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_item(status.as_str(), elapsed_ms as f64 / 1000.0);
}

/// Record that an execution context was torn down and will restart lazily.
pub fn record_worker_restart(slot: usize, reason: &str) {
    tracing::info!(slot, reason, "execution context terminated");

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_restart(reason);
}

/// Record the final state of a job.
pub fn record_job_finished(job_id: JobId, state: &str, items: u64, elapsed: Duration) {
    tracing::info!(
        job_id = %job_id,
        state,
        items,
        elapsed_ms = elapsed.as_millis() as u64,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(state);
}

/// Start timing a work item. The returned guard tracks in-flight workers.
pub fn start_item_timer() -> ItemTimer {
    #[cfg(feature = "metrics")]
    crate::metrics::worker_started();

    ItemTimer {
        start: Instant::now(),
    }
}

/// Wall-clock timer for one work item.
#[derive(Debug)]
pub struct ItemTimer {
    start: Instant,
}

impl ItemTimer {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Drop for ItemTimer {
    fn drop(&mut self) {
        #[cfg(feature = "metrics")]
        crate::metrics::worker_finished();
    }
}
