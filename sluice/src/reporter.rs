//! Sinks for per-item outcomes and job totals.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::item::WorkItem;
use crate::outcome::{Outcome, OutcomeStatus};

/// Receives one report per work item, from many worker slots at once.
///
/// Implementations must not assume any ordering between reports. `close` is
/// not guaranteed to run, so every `report` must leave its state durable.
#[async_trait]
pub trait PipesReporter: Send + Sync {
    async fn report(&self, item: &WorkItem, outcome: &Outcome, elapsed_ms: u64);

    fn supports_total_count(&self) -> bool {
        false
    }

    /// Total number of items the source expects to produce. Only called when
    /// [`supports_total_count`](Self::supports_total_count) returns true.
    async fn report_total(&self, _count: u64) {}

    /// The job terminated abnormally.
    async fn error(&self, err: &anyhow::Error) {
        tracing::error!("pipeline error: {err:#}");
    }

    async fn error_message(&self, message: &str) {
        tracing::error!("pipeline error: {message}");
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reporter that writes every outcome to the tracing log.
#[derive(Clone, Debug, Default)]
pub struct LoggingReporter;

#[async_trait]
impl PipesReporter for LoggingReporter {
    async fn report(&self, item: &WorkItem, outcome: &Outcome, elapsed_ms: u64) {
        match &outcome.error_message {
            Some(message) => tracing::warn!(
                item_id = %item.id,
                fetch_key = %item.fetch_key.fetch_key,
                status = %outcome.status,
                elapsed_ms,
                "{message}"
            ),
            None => tracing::info!(
                item_id = %item.id,
                fetch_key = %item.fetch_key.fetch_key,
                status = %outcome.status,
                elapsed_ms,
                "item reported"
            ),
        }
    }

    fn supports_total_count(&self) -> bool {
        true
    }

    async fn report_total(&self, count: u64) {
        tracing::info!(count, "source total");
    }
}

/// Forwards every call to each wrapped reporter in order.
#[derive(Clone, Default)]
pub struct CompositeReporter {
    reporters: Vec<Arc<dyn PipesReporter>>,
}

impl std::fmt::Debug for CompositeReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeReporter")
            .field("reporters", &self.reporters.len())
            .finish()
    }
}

impl CompositeReporter {
    pub fn new(reporters: Vec<Arc<dyn PipesReporter>>) -> Self {
        Self { reporters }
    }

    pub fn with(mut self, reporter: Arc<dyn PipesReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

#[async_trait]
impl PipesReporter for CompositeReporter {
    async fn report(&self, item: &WorkItem, outcome: &Outcome, elapsed_ms: u64) {
        for reporter in &self.reporters {
            reporter.report(item, outcome, elapsed_ms).await;
        }
    }

    fn supports_total_count(&self) -> bool {
        self.reporters.iter().any(|r| r.supports_total_count())
    }

    async fn report_total(&self, count: u64) {
        for reporter in &self.reporters {
            if reporter.supports_total_count() {
                reporter.report_total(count).await;
            }
        }
    }

    async fn error(&self, err: &anyhow::Error) {
        for reporter in &self.reporters {
            reporter.error(err).await;
        }
    }

    async fn error_message(&self, message: &str) {
        for reporter in &self.reporters {
            reporter.error_message(message).await;
        }
    }

    /// Closes every reporter, returning the first failure.
    async fn close(&self) -> anyhow::Result<()> {
        let mut first_err = None;
        for reporter in &self.reporters {
            if let Err(err) = reporter.close().await {
                tracing::warn!("reporter close failed: {err:#}");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Passes through only outcomes whose status is selected.
///
/// An empty include set accepts every status not in the exclude set.
pub struct FilteringReporter {
    inner: Arc<dyn PipesReporter>,
    include: HashSet<OutcomeStatus>,
    exclude: HashSet<OutcomeStatus>,
}

impl std::fmt::Debug for FilteringReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilteringReporter")
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .finish()
    }
}

impl FilteringReporter {
    pub fn new(inner: Arc<dyn PipesReporter>) -> Self {
        Self {
            inner,
            include: HashSet::new(),
            exclude: HashSet::new(),
        }
    }

    pub fn include(mut self, statuses: impl IntoIterator<Item = OutcomeStatus>) -> Self {
        self.include.extend(statuses);
        self
    }

    pub fn exclude(mut self, statuses: impl IntoIterator<Item = OutcomeStatus>) -> Self {
        self.exclude.extend(statuses);
        self
    }

    pub fn accepts(&self, status: OutcomeStatus) -> bool {
        if self.exclude.contains(&status) {
            return false;
        }
        self.include.is_empty() || self.include.contains(&status)
    }
}

#[async_trait]
impl PipesReporter for FilteringReporter {
    async fn report(&self, item: &WorkItem, outcome: &Outcome, elapsed_ms: u64) {
        if self.accepts(outcome.status) {
            self.inner.report(item, outcome, elapsed_ms).await;
        }
    }

    fn supports_total_count(&self) -> bool {
        self.inner.supports_total_count()
    }

    async fn report_total(&self, count: u64) {
        self.inner.report_total(count).await;
    }

    async fn error(&self, err: &anyhow::Error) {
        self.inner.error(err).await;
    }

    async fn error_message(&self, message: &str) {
        self.inner.error_message(message).await;
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}
