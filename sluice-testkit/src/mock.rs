use async_trait::async_trait;
use parking_lot::Mutex;
use sluice::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Shared, built-once state for [`MockProcessor`].
#[derive(Debug)]
pub struct MockModel {
    pub name: String,
}

/// Processor whose behaviour is chosen by the fetched body:
///
/// - `crash` panics
/// - `hang` never finishes
/// - `sleep:<ms>` waits, then succeeds
/// - `exception` returns partial metadata with an exception
/// - `error` returns `Err`
/// - anything else succeeds with `content` and `length` metadata
#[derive(Clone, Default)]
pub struct MockProcessor {
    model: Arc<ProcessingModel<MockModel>>,
    model_loads: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak_running: Arc<AtomicUsize>,
    processed: Arc<Mutex<Vec<String>>>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the shared model was built.
    pub fn model_loads(&self) -> usize {
        self.model_loads.load(Ordering::SeqCst)
    }

    /// Items that entered `process`, including ones that never left.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Highest number of items observed inside `process` at once.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    /// Bodies that were processed to completion.
    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().clone()
    }

    /// Poll until at least `count` items have started.
    pub async fn wait_until_started(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.started() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    async fn load_model(&self) -> anyhow::Result<Arc<MockModel>> {
        let loads = Arc::clone(&self.model_loads);
        self.model
            .get_or_init(|| async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(MockModel {
                    name: "mock-model".to_string(),
                })
            })
            .await
    }

    async fn run(&self, body: String) -> anyhow::Result<ProcessOutput> {
        let model = self.load_model().await?;

        if body == "crash" {
            panic!("processor crashed on `{body}`");
        }
        if body == "hang" {
            std::future::pending::<()>().await;
        }
        if let Some(ms) = body.strip_prefix("sleep:") {
            let ms: u64 = ms.trim().parse()?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if body == "error" {
            anyhow::bail!("processor failed on `{body}`");
        }

        let mut metadata = Metadata::new();
        metadata.set("content", body.clone());
        metadata.set("length", body.len().to_string());
        metadata.set("model", model.name.clone());

        if body == "exception" {
            return Ok(ProcessOutput::new(vec![metadata]).with_exception("unexpected end of document"));
        }
        self.processed.lock().push(body);
        Ok(ProcessOutput::new(vec![metadata]))
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Processor for MockProcessor {
    async fn process(&self, mut content: ByteStream, _metadata: &Metadata) -> anyhow::Result<ProcessOutput> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(Arc::clone(&self.running));

        let mut body = String::new();
        content.read_to_string(&mut body).await?;
        self.run(body).await
    }
}

#[derive(Clone, Debug)]
pub struct ReportRecord {
    pub item: WorkItem,
    pub outcome: Outcome,
}

/// Reporter that keeps everything it is told.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<ReportRecord>>>,
    totals: Arc<Mutex<Vec<u64>>>,
    errors: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ReportRecord> {
        self.reports.lock().clone()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.reports
            .lock()
            .iter()
            .map(|record| record.outcome.clone())
            .collect()
    }

    /// Status per item id. Panics if an item was reported twice.
    pub fn statuses(&self) -> HashMap<String, OutcomeStatus> {
        let mut statuses = HashMap::new();
        for record in self.reports.lock().iter() {
            let previous = statuses.insert(
                record.outcome.item_id.as_str().to_string(),
                record.outcome.status,
            );
            assert!(
                previous.is_none(),
                "item {} reported more than once",
                record.outcome.item_id
            );
        }
        statuses
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.reports
            .lock()
            .iter()
            .filter(|record| record.outcome.status == status)
            .count()
    }

    pub fn totals(&self) -> Vec<u64> {
        self.totals.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn assert_report_count_eq(&self, expected: usize) {
        let actual = self.reports.lock().len();
        assert_eq!(actual, expected, "Expected {expected} reports, got {actual}");
    }
}

#[async_trait]
impl PipesReporter for RecordingReporter {
    async fn report(&self, item: &WorkItem, outcome: &Outcome, _elapsed_ms: u64) {
        self.reports.lock().push(ReportRecord {
            item: item.clone(),
            outcome: outcome.clone(),
        });
    }

    fn supports_total_count(&self) -> bool {
        true
    }

    async fn report_total(&self, count: u64) {
        self.totals.lock().push(count);
    }

    async fn error(&self, err: &anyhow::Error) {
        self.errors.lock().push(format!("{err:#}"));
    }

    async fn error_message(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
