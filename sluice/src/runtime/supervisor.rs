use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::config::{IsolationMode, PipesConfig};
use crate::error::PipesError;
use crate::extension::ExtensionRegistry;
use crate::item::{JobId, WorkItem};
use crate::job_status::{JobState, JobStatusTracker};
use crate::outcome::{Outcome, OutcomeStatus};
use crate::reporter::PipesReporter;
use crate::source::PipesIterator;
use crate::state::spawn_expiry_sweeper;
use crate::telemetry;

use super::context::{ChildProcessContext, ExecutionContext, ExecutionResult, InProcessContext};
use super::worker::{PipesWorker, Processor};

/// Token for signaling cancellation to the dispatch loop and its helpers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of work for [`Supervisor::run`] or [`Supervisor::submit`].
pub struct JobRequest {
    pub job_id: JobId,
    pub source: Box<dyn PipesIterator>,
    /// Fetchers that must resolve before any item is dispatched.
    pub fetcher_ids: Vec<String>,
    /// Emitters that must resolve before any item is dispatched.
    pub emitter_ids: Vec<String>,
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("job_id", &self.job_id)
            .field("fetcher_ids", &self.fetcher_ids)
            .field("emitter_ids", &self.emitter_ids)
            .finish()
    }
}

impl JobRequest {
    pub fn new(source: impl PipesIterator + 'static) -> Self {
        Self {
            job_id: JobId::new(),
            source: Box::new(source),
            fetcher_ids: Vec::new(),
            emitter_ids: Vec::new(),
        }
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_fetcher(mut self, id: impl Into<String>) -> Self {
        self.fetcher_ids.push(id.into());
        self
    }

    pub fn with_emitter(mut self, id: impl Into<String>) -> Self {
        self.emitter_ids.push(id.into());
        self
    }
}

/// What a finished job did.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSummary {
    pub job_id: JobId,
    pub state: JobState,
    /// Outcomes reported, by status.
    pub counts: HashMap<OutcomeStatus, u64>,
    /// Whether the job was stopped before its source was exhausted.
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl JobSummary {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn count(&self, status: OutcomeStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn has_error(&self) -> bool {
        self.counts
            .iter()
            .any(|(status, count)| status.is_failure() && *count > 0)
    }
}

/// Handle to a job started with [`Supervisor::submit`].
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    cancel: ShutdownToken,
    task: JoinHandle<Result<JobSummary, PipesError>>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Request a graceful stop: intake stops, in-flight items get the
    /// shutdown grace period, everything else is reported `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<JobSummary, PipesError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(PipesError::Cancelled(self.job_id)),
            Err(err) => Err(PipesError::Internal(format!("job task failed: {err}"))),
        }
    }
}

struct Slot {
    index: usize,
    context: Box<dyn ExecutionContext>,
}

/// Per-job state shared by the dispatch loop and every in-flight item.
struct JobRun {
    job_id: JobId,
    reporter: Arc<dyn PipesReporter>,
    tracker: JobStatusTracker,
    timeout: Duration,
    force: ShutdownToken,
    counts: Mutex<HashMap<OutcomeStatus, u64>>,
    error_latched: AtomicBool,
    fatal: Mutex<Option<PipesError>>,
}

impl JobRun {
    /// Run `item` in `slot` under the watchdog. Always yields an outcome.
    async fn execute(&self, slot: &mut Slot, item: &WorkItem) -> Outcome {
        enum Ended {
            Finished(ExecutionResult),
            TimedOut,
            Stopped,
        }

        let timer = telemetry::start_item_timer();
        let ended = tokio::select! {
            result = slot.context.execute(item) => Ended::Finished(result),
            _ = tokio::time::sleep(self.timeout) => Ended::TimedOut,
            _ = self.force.cancelled() => Ended::Stopped,
        };
        let elapsed_ms = timer.elapsed_ms();

        let outcome = match ended {
            Ended::Finished(ExecutionResult::Completed(outcome)) => outcome,
            Ended::Finished(ExecutionResult::Crashed { reason }) => {
                telemetry::record_worker_restart(slot.index, "crash");
                Outcome::failure(item.id.clone(), OutcomeStatus::ProcessCrash, reason)
            }
            Ended::Finished(ExecutionResult::Fatal(err)) => {
                let message = format!("job stopped: {err}");
                self.abort(err);
                cancelled_outcome(item, &message)
            }
            Ended::TimedOut => {
                slot.context.terminate().await;
                telemetry::record_worker_restart(slot.index, "timeout");
                Outcome::failure(
                    item.id.clone(),
                    OutcomeStatus::Timeout,
                    format!("no result within {}ms", self.timeout.as_millis()),
                )
            }
            Ended::Stopped => {
                slot.context.terminate().await;
                telemetry::record_worker_restart(slot.index, "cancelled");
                cancelled_outcome(item, "job stopped while the item was running")
            }
        };
        outcome.with_elapsed_ms(elapsed_ms)
    }

    /// Forward an outcome to the reporter and fold it into job state.
    async fn deliver(&self, item: &WorkItem, outcome: Outcome) {
        telemetry::record_item_outcome(self.job_id, &item.id, outcome.status, outcome.elapsed_ms);
        self.reporter.report(item, &outcome, outcome.elapsed_ms).await;
        *self.counts.lock().entry(outcome.status).or_default() += 1;

        if outcome.is_failure() && !self.error_latched.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.tracker.record_error(self.job_id).await {
                self.abort(err);
            }
        }
    }

    /// Record a fatal error and stop everything still running.
    fn abort(&self, err: PipesError) {
        tracing::error!(job_id = %self.job_id, "stopping job: {err}");
        self.fatal.lock().get_or_insert(err);
        self.force.cancel();
    }

    fn items_reported(&self) -> u64 {
        self.counts.lock().values().sum()
    }
}

fn cancelled_outcome(item: &WorkItem, message: &str) -> Outcome {
    Outcome::failure(item.id.clone(), OutcomeStatus::Cancelled, message)
}

/// Dispatches work items from a source to `num_workers` isolated worker slots.
pub struct Supervisor {
    config: PipesConfig,
    registry: Arc<ExtensionRegistry>,
    processor: Option<Arc<dyn Processor>>,
    reporter: Arc<dyn PipesReporter>,
    tracker: JobStatusTracker,
    shutdown_token: ShutdownToken,
    active_jobs: Mutex<HashMap<JobId, ShutdownToken>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("active_jobs", &self.active_jobs.lock().len())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl Supervisor {
    pub(crate) fn new(
        config: PipesConfig,
        registry: Arc<ExtensionRegistry>,
        processor: Option<Arc<dyn Processor>>,
        reporter: Arc<dyn PipesReporter>,
    ) -> Self {
        let tracker = JobStatusTracker::new(registry.store(), config.store_retry);
        Self {
            config,
            registry,
            processor,
            reporter,
            tracker,
            shutdown_token: ShutdownToken::new(),
            active_jobs: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipesConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ExtensionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn tracker(&self) -> &JobStatusTracker {
        &self.tracker
    }

    /// Start background housekeeping (the registration expiry sweeper, when
    /// configured).
    pub fn start(&self) {
        let Some(expiry) = self.config.expiry else {
            return;
        };
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        *sweeper = Some(spawn_expiry_sweeper(
            self.registry.store(),
            Duration::from_millis(expiry.max_idle_ms),
            Duration::from_millis(expiry.sweep_interval_ms),
            self.shutdown_token.clone(),
        ));
    }

    /// Cancel every running job and stop background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("initiating supervisor shutdown");
        self.shutdown_token.cancel();

        for (job_id, token) in self.active_jobs.lock().iter() {
            tracing::info!(job_id = %job_id, "cancelling job");
            token.cancel();
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                tracing::warn!("sweeper task failed: {err}");
            }
        }
    }

    /// Run a job on a spawned task.
    pub fn submit(self: &Arc<Self>, request: JobRequest) -> JobHandle {
        let job_id = request.job_id;
        let cancel = self.register_job(job_id);
        let this = Arc::clone(self);
        let job_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = this.execute_job(request, &job_cancel).await;
            this.active_jobs.lock().remove(&job_id);
            result
        });
        JobHandle {
            job_id,
            cancel,
            task,
        }
    }

    /// Run a job to completion on the current task.
    pub async fn run(&self, request: JobRequest) -> Result<JobSummary, PipesError> {
        let job_id = request.job_id;
        let cancel = self.register_job(job_id);
        let result = self.execute_job(request, &cancel).await;
        self.active_jobs.lock().remove(&job_id);
        result
    }

    fn register_job(&self, job_id: JobId) -> ShutdownToken {
        let token = ShutdownToken::new();
        if self.shutdown_token.is_cancelled() {
            token.cancel();
        }
        self.active_jobs.lock().insert(job_id, token.clone());
        token
    }

    async fn execute_job(
        &self,
        request: JobRequest,
        cancel: &ShutdownToken,
    ) -> Result<JobSummary, PipesError> {
        let job_id = request.job_id;
        self.run_job(request, cancel)
            .instrument(telemetry::job_span(job_id))
            .await
    }

    async fn run_job(
        &self,
        request: JobRequest,
        cancel: &ShutdownToken,
    ) -> Result<JobSummary, PipesError> {
        let JobRequest {
            job_id,
            mut source,
            fetcher_ids,
            emitter_ids,
        } = request;
        let started = Instant::now();

        if let Err(err) = self.tracker.create(job_id).await {
            return Err(self.fail_job(job_id, err, 0).await);
        }

        let slots = match self
            .prepare(source.as_mut(), &fetcher_ids, &emitter_ids)
            .await
        {
            Ok(slots) => slots,
            Err(err) => return Err(self.fail_job(job_id, err, 0).await),
        };

        if cancel.is_cancelled() {
            let err = PipesError::Cancelled(job_id);
            return Err(self.fail_job(job_id, err, 0).await);
        }

        if let Err(err) = self.tracker.mark_running(job_id).await {
            return Err(self.fail_job(job_id, err, 0).await);
        }
        tracing::info!(workers = slots.len(), "job running");

        let run = Arc::new(JobRun {
            job_id,
            reporter: Arc::clone(&self.reporter),
            tracker: self.tracker.clone(),
            timeout: self.config.per_item_timeout(),
            force: ShutdownToken::new(),
            counts: Mutex::new(HashMap::new()),
            error_latched: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });

        let cancelled = self.dispatch(&run, source, slots, cancel).await;
        let items = run.items_reported();

        let fatal = run.fatal.lock().take();
        if let Some(err) = fatal {
            return Err(self.fail_job(job_id, err, items).await);
        }

        let counts = run.counts.lock().clone();
        let has_error = run.error_latched.load(Ordering::SeqCst);
        let status = match self.tracker.complete(job_id, has_error, items).await {
            Ok(status) => status,
            Err(err) => return Err(self.fail_job(job_id, err, items).await),
        };

        let summary = JobSummary {
            job_id,
            state: status.state(),
            counts,
            cancelled,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        telemetry::record_job_finished(job_id, summary.state.as_str(), items, started.elapsed());
        Ok(summary)
    }

    /// Validate the job's extensions, open the source, and build the slots.
    async fn prepare(
        &self,
        source: &mut dyn PipesIterator,
        fetcher_ids: &[String],
        emitter_ids: &[String],
    ) -> Result<Vec<Slot>, PipesError> {
        for id in fetcher_ids {
            self.registry.fetcher(id).await?;
        }
        for id in emitter_ids {
            self.registry.emitter(id).await?;
        }

        let mut slots = Vec::with_capacity(self.config.num_workers);
        for index in 0..self.config.num_workers {
            slots.push(Slot {
                index,
                context: self.new_context()?,
            });
        }

        source
            .open()
            .await
            .map_err(|err| PipesError::Source(format!("failed to open source: {err:#}")))?;

        if self.reporter.supports_total_count() {
            if let Some(total) = source.total_count().await {
                self.reporter.report_total(total).await;
            }
        }

        Ok(slots)
    }

    fn new_context(&self) -> Result<Box<dyn ExecutionContext>, PipesError> {
        match &self.config.isolation {
            IsolationMode::InProcess => {
                let processor = self.processor.clone().ok_or_else(|| {
                    PipesError::config("in-process isolation requires a processor")
                })?;
                let worker = PipesWorker::new(Arc::clone(&self.registry), processor);
                Ok(Box::new(InProcessContext::new(Arc::new(worker))))
            }
            IsolationMode::ChildProcess(child) => {
                Ok(Box::new(ChildProcessContext::new(child.clone())))
            }
        }
    }

    /// Report a job-level failure and mark the job finished with errors.
    async fn fail_job(&self, job_id: JobId, err: PipesError, items: u64) -> PipesError {
        self.reporter.error_message(&err.to_string()).await;
        if let Err(status_err) = self.tracker.complete(job_id, true, items).await {
            tracing::warn!(job_id = %job_id, "could not record job failure: {status_err}");
        }
        telemetry::record_job_finished(job_id, "failed", items, Duration::ZERO);
        err
    }

    /// Drive the source through the slots until it is exhausted, the job is
    /// cancelled, or a fatal error stops it. Returns whether it was cancelled.
    async fn dispatch(
        &self,
        run: &Arc<JobRun>,
        source: Box<dyn PipesIterator>,
        slots: Vec<Slot>,
        cancel: &ShutdownToken,
    ) -> bool {
        let (intake_tx, mut intake_rx) = mpsc::channel(self.config.queue_size);
        let feeder = spawn_feeder(source, intake_tx, cancel.clone(), run.force.clone());

        let (slot_tx, mut slot_rx) = mpsc::channel::<Slot>(slots.len().max(1));
        for slot in slots {
            if slot_tx.try_send(slot).is_err() {
                tracing::error!("slot pool rejected a slot");
            }
        }

        let mut in_flight = JoinSet::new();
        let mut undispatched: Vec<WorkItem> = Vec::new();
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = run.force.cancelled() => break,
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.check_joined(joined, &slot_tx);
                    continue;
                }
                next = intake_rx.recv() => next,
            };

            let item = match next {
                None => break,
                Some(Ok(item)) => item,
                Some(Err(err)) => {
                    run.abort(PipesError::Source(format!("{err:#}")));
                    break;
                }
            };

            let slot = loop {
                tokio::select! {
                    biased;
                    _ = run.force.cancelled() => break None,
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break None;
                    }
                    slot = slot_rx.recv() => break slot,
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        self.check_joined(joined, &slot_tx);
                    }
                }
            };
            let Some(mut slot) = slot else {
                undispatched.push(item);
                break;
            };

            let task_run = Arc::clone(run);
            let slot_tx = slot_tx.clone();
            let span = telemetry::item_span(run.job_id, &item.id, item.fetcher_id());
            in_flight.spawn(
                async move {
                    let outcome = task_run.execute(&mut slot, &item).await;
                    task_run.deliver(&item, outcome).await;
                    if slot_tx.send(slot).await.is_err() {
                        tracing::debug!("slot pool closed before slot was returned");
                    }
                }
                .instrument(span),
            );
        }

        // Everything already pulled from the source gets an outcome.
        intake_rx.close();
        while let Some(next) = intake_rx.recv().await {
            if let Ok(item) = next {
                undispatched.push(item);
            }
        }
        match feeder.await {
            Ok(Some(item)) => undispatched.push(item),
            Ok(None) => {}
            Err(err) => tracing::warn!("source feeder failed: {err}"),
        }
        if !undispatched.is_empty() {
            tracing::info!(count = undispatched.len(), "reporting undispatched items as cancelled");
        }
        for item in undispatched {
            run.deliver(&item, cancelled_outcome(&item, "job stopped before the item was dispatched"))
                .await;
        }

        if self
            .drain_in_flight(&mut in_flight, &slot_tx, cancel, &run.force)
            .await
        {
            cancelled = true;
        }

        drop(slot_tx);
        slot_rx.close();
        let mut contexts = Vec::new();
        while let Some(slot) = slot_rx.recv().await {
            contexts.push(slot.context);
        }
        futures::future::join_all(contexts.iter_mut().map(|context| context.close())).await;

        cancelled
    }

    /// Wait for in-flight items. After a cancel request they get the shutdown
    /// grace period, then the rest are force-terminated. Returns whether a
    /// cancel request arrived while waiting.
    async fn drain_in_flight(
        &self,
        in_flight: &mut JoinSet<()>,
        slot_tx: &mpsc::Sender<Slot>,
        cancel: &ShutdownToken,
        force: &ShutdownToken,
    ) -> bool {
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = force.cancelled() => break,
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = in_flight.join_next() => match joined {
                    Some(joined) => self.check_joined(joined, slot_tx),
                    None => return cancelled,
                },
            }
        }

        if !force.is_cancelled() && !in_flight.is_empty() {
            tracing::info!(
                in_flight = in_flight.len(),
                grace_ms = self.config.shutdown_grace_ms,
                "waiting for in-flight items"
            );
            let grace = tokio::time::sleep(self.config.shutdown_grace());
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    biased;
                    joined = in_flight.join_next() => match joined {
                        Some(joined) => self.check_joined(joined, slot_tx),
                        None => return cancelled,
                    },
                    _ = &mut grace => {
                        tracing::warn!(in_flight = in_flight.len(), "grace period expired, terminating");
                        break;
                    }
                }
            }
        }

        force.cancel();
        while let Some(joined) = in_flight.join_next().await {
            self.check_joined(joined, slot_tx);
        }
        cancelled
    }

    /// A panicked item task loses its slot; replace it.
    fn check_joined(&self, joined: Result<(), tokio::task::JoinError>, slot_tx: &mpsc::Sender<Slot>) {
        let Err(err) = joined else {
            return;
        };
        tracing::error!("item task failed: {err}");
        match self.new_context() {
            Ok(context) => {
                let slot = Slot {
                    index: self.config.num_workers,
                    context,
                };
                if slot_tx.try_send(slot).is_err() {
                    tracing::warn!("could not replace lost worker slot");
                }
            }
            Err(err) => tracing::warn!("could not replace lost worker slot: {err}"),
        }
    }
}

/// Pull items from `source` into the bounded intake channel. Returns an item
/// that was pulled but could not be handed over because intake closed.
fn spawn_feeder(
    mut source: Box<dyn PipesIterator>,
    intake: mpsc::Sender<anyhow::Result<WorkItem>>,
    cancel: ShutdownToken,
    force: ShutdownToken,
) -> JoinHandle<Option<WorkItem>> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = force.cancelled() => return None,
                next = source.next() => next,
            };
            match next {
                Ok(Some(item)) => {
                    if let Err(mpsc::error::SendError(unsent)) = intake.send(Ok(item)).await {
                        return unsent.ok();
                    }
                }
                Ok(None) => {
                    tracing::debug!("source exhausted");
                    return None;
                }
                Err(err) => {
                    let _ = intake.send(Err(err)).await;
                    return None;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_once_cancelled() {
        let token = ShutdownToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already-cancelled token should not block");
    }

    #[test]
    fn summary_counts_failures() {
        let mut counts = HashMap::new();
        counts.insert(OutcomeStatus::Success, 2);
        counts.insert(OutcomeStatus::Timeout, 0);
        let summary = JobSummary {
            job_id: JobId::new(),
            state: JobState::Completed,
            counts,
            cancelled: false,
            elapsed_ms: 1,
        };
        assert_eq!(summary.total(), 2);
        assert!(!summary.has_error());
        assert_eq!(summary.count(OutcomeStatus::FetchFailure), 0);
    }
}
