//! Runtime integration tests for in-process isolation.
//!
//! Tests exactly-once reporting, per-item failure classification, the
//! watchdog, crash containment, cancellation, setup failures, and job status
//! shared through one state store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice::*;
use sluice_testkit::{
    source_of, work_item, work_items, MockExtensions, MockProcessor, OutageStore,
    RecordingReporter,
};
use tokio::time::timeout;

struct Harness {
    supervisor: Arc<Supervisor>,
    extensions: MockExtensions,
    processor: MockProcessor,
    reporter: RecordingReporter,
}

async fn harness(config: PipesConfig) -> anyhow::Result<Harness> {
    harness_on(config, Arc::new(LocalStateStore::new())).await
}

async fn harness_on(config: PipesConfig, store: Arc<dyn StateStore>) -> anyhow::Result<Harness> {
    let extensions = MockExtensions::install(store).await?;
    let processor = MockProcessor::new();
    let reporter = RecordingReporter::new();
    let supervisor = SupervisorBuilder::new(config)
        .with_registry(Arc::clone(&extensions.registry))
        .with_processor(Arc::new(processor.clone()))
        .with_reporter(Arc::new(reporter.clone()))
        .build()?;
    Ok(Harness {
        supervisor: Arc::new(supervisor),
        extensions,
        processor,
        reporter,
    })
}

async fn run(harness: &Harness, items: Vec<WorkItem>) -> Result<JobSummary, PipesError> {
    timeout(
        Duration::from_secs(30),
        harness.supervisor.run(JobRequest::new(source_of(items))),
    )
    .await
    .expect("job should finish")
}

#[tokio::test]
async fn every_item_is_reported_exactly_once() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default().with_num_workers(4)).await?;

    let summary = run(&h, work_items(50)).await?;

    assert_eq!(summary.total(), 50);
    assert_eq!(summary.count(OutcomeStatus::Success), 50);
    assert_eq!(summary.state, JobState::Completed);
    assert!(!summary.cancelled);

    let statuses = h.reporter.statuses();
    let expected: HashSet<String> = (0..50).map(|i| format!("item-{i}")).collect();
    assert_eq!(statuses.keys().cloned().collect::<HashSet<_>>(), expected);
    h.extensions.emitter.assert_emit_count_eq(50);
    assert_eq!(h.reporter.totals(), vec![50]);
    Ok(())
}

#[tokio::test]
async fn concurrency_is_bounded_by_worker_count() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default().with_num_workers(3)).await?;
    let items = (0..12)
        .map(|i| work_item(&format!("slow-{i}"), "sleep:30"))
        .collect();

    run(&h, items).await?;

    assert!(h.processor.peak_running() <= 3);
    assert!(h.processor.peak_running() >= 2);
    assert_eq!(h.processor.model_loads(), 1);
    Ok(())
}

#[tokio::test]
async fn failures_are_classified_per_item() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default().with_num_workers(2)).await?;
    h.extensions.emitter.fail_on("rejected");

    let items = vec![
        work_item("ok", "plain text"),
        work_item("gone", "missing-report.pdf"),
        work_item("partial", "exception"),
        work_item("partial-skip", "exception").with_on_failure(OnFailurePolicy::Skip),
        work_item("broken", "error"),
        work_item("rejected", "plain text"),
    ];
    let summary = run(&h, items).await?;

    let statuses = h.reporter.statuses();
    assert_eq!(statuses["ok"], OutcomeStatus::Success);
    assert_eq!(statuses["gone"], OutcomeStatus::FetchFailure);
    assert_eq!(statuses["partial"], OutcomeStatus::ProcessException);
    assert_eq!(statuses["partial-skip"], OutcomeStatus::ProcessException);
    assert_eq!(statuses["broken"], OutcomeStatus::ProcessException);
    assert_eq!(statuses["rejected"], OutcomeStatus::EmitFailure);

    let emitted: HashSet<String> = h.extensions.emitter.emitted_keys().into_iter().collect();
    assert!(emitted.contains("ok"));
    assert!(emitted.contains("partial"));
    assert!(!emitted.contains("partial-skip"));
    assert!(!emitted.contains("gone"));

    let partial = h
        .reporter
        .outcomes()
        .into_iter()
        .find(|outcome| outcome.item_id.as_str() == "partial")
        .expect("partial reported");
    assert_eq!(partial.result_metadata.len(), 1);
    assert!(partial.error_message.is_some());

    assert_eq!(summary.state, JobState::CompletedWithErrors);
    assert!(summary.has_error());
    Ok(())
}

#[tokio::test]
async fn hung_item_times_out_and_slot_is_reused() -> anyhow::Result<()> {
    let config = PipesConfig::default()
        .with_num_workers(1)
        .with_per_item_timeout(500);
    let h = harness(config).await?;

    let items = vec![work_item("stuck", "sleep:2000"), work_item("next", "fine")];
    run(&h, items).await?;

    let outcomes = h.reporter.outcomes();
    let stuck = outcomes
        .iter()
        .find(|outcome| outcome.item_id.as_str() == "stuck")
        .expect("stuck reported");
    assert_eq!(stuck.status, OutcomeStatus::Timeout);
    assert!(
        (500..=600).contains(&stuck.elapsed_ms),
        "elapsed {}ms",
        stuck.elapsed_ms
    );
    assert_eq!(h.reporter.statuses()["next"], OutcomeStatus::Success);
    Ok(())
}

#[tokio::test]
async fn processor_panic_is_contained() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default().with_num_workers(1)).await?;

    let items = vec![
        work_item("a", "fine"),
        work_item("boom", "crash"),
        work_item("b", "still fine"),
    ];
    let summary = run(&h, items).await?;

    let statuses = h.reporter.statuses();
    assert_eq!(statuses["a"], OutcomeStatus::Success);
    assert_eq!(statuses["boom"], OutcomeStatus::ProcessCrash);
    assert_eq!(statuses["b"], OutcomeStatus::Success);
    assert_eq!(summary.count(OutcomeStatus::ProcessCrash), 1);
    Ok(())
}

#[tokio::test]
async fn cancel_reports_in_flight_and_queued_items_as_cancelled() -> anyhow::Result<()> {
    let config = PipesConfig::default()
        .with_num_workers(2)
        .with_shutdown_grace(100);
    let h = harness(config).await?;

    let mut items = vec![work_item("stuck-1", "hang"), work_item("stuck-2", "hang")];
    items.extend(work_items(5));
    let handle = h.supervisor.submit(JobRequest::new(source_of(items)));

    assert!(h.processor.wait_until_started(2, Duration::from_secs(5)).await);
    handle.cancel();
    let summary = timeout(Duration::from_secs(10), handle.wait()).await??;

    assert!(summary.cancelled);
    assert_eq!(summary.total(), 7);
    assert_eq!(summary.count(OutcomeStatus::Cancelled), 7);
    assert_eq!(h.reporter.statuses().len(), 7);
    assert_eq!(summary.state, JobState::CompletedWithErrors);
    Ok(())
}

#[tokio::test]
async fn grace_period_lets_in_flight_items_finish() -> anyhow::Result<()> {
    let config = PipesConfig::default()
        .with_num_workers(2)
        .with_shutdown_grace(5_000);
    let h = harness(config).await?;

    let items = vec![
        work_item("slow-1", "sleep:200"),
        work_item("slow-2", "sleep:200"),
        work_item("never", "fine"),
    ];
    let handle = h.supervisor.submit(JobRequest::new(source_of(items)));

    assert!(h.processor.wait_until_started(2, Duration::from_secs(5)).await);
    handle.cancel();
    let summary = timeout(Duration::from_secs(10), handle.wait()).await??;

    let statuses = h.reporter.statuses();
    assert_eq!(statuses["slow-1"], OutcomeStatus::Success);
    assert_eq!(statuses["slow-2"], OutcomeStatus::Success);
    assert_eq!(statuses["never"], OutcomeStatus::Cancelled);
    assert!(summary.cancelled);
    Ok(())
}

#[tokio::test]
async fn unknown_fetcher_fails_before_dispatch() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default()).await?;
    let job_id = JobId::new();

    let request = JobRequest::new(source_of(work_items(3)))
        .with_job_id(job_id)
        .with_fetcher("no-such-fetcher");
    let err = h.supervisor.run(request).await.unwrap_err();

    assert!(matches!(err, PipesError::Config(_)));
    assert!(err.is_setup_error());
    h.reporter.assert_report_count_eq(0);
    assert_eq!(h.processor.started(), 0);
    assert_eq!(h.reporter.errors().len(), 1);

    let status = h.supervisor.tracker().get(job_id).await?.expect("status recorded");
    assert_eq!(status.state(), JobState::CompletedWithErrors);
    Ok(())
}

struct BrokenSource {
    fail_on_open: bool,
    handed_out: usize,
}

#[async_trait]
impl PipesIterator for BrokenSource {
    async fn open(&mut self) -> anyhow::Result<()> {
        if self.fail_on_open {
            anyhow::bail!("listing unavailable");
        }
        Ok(())
    }

    async fn next(&mut self) -> anyhow::Result<Option<WorkItem>> {
        if self.handed_out == 2 {
            anyhow::bail!("listing truncated");
        }
        self.handed_out += 1;
        Ok(Some(work_item(&format!("listed-{}", self.handed_out), "fine")))
    }
}

#[tokio::test]
async fn source_open_failure_fails_the_job() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default()).await?;

    let err = h
        .supervisor
        .run(JobRequest::new(BrokenSource {
            fail_on_open: true,
            handed_out: 0,
        }))
        .await
        .unwrap_err();

    assert!(matches!(err, PipesError::Source(_)));
    h.reporter.assert_report_count_eq(0);
    Ok(())
}

#[tokio::test]
async fn source_error_mid_stream_fails_the_job() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default().with_num_workers(1)).await?;

    let err = run_request(
        &h,
        JobRequest::new(BrokenSource {
            fail_on_open: false,
            handed_out: 0,
        }),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, PipesError::Source(_)));
    assert_eq!(h.reporter.errors().len(), 1, "fatal error is reported once");
    // Items pulled before the failure are reported once, finished or cancelled.
    let statuses = h.reporter.statuses();
    assert_eq!(statuses.len(), 2);
    Ok(())
}

#[tokio::test]
async fn state_store_outage_during_dispatch_fails_the_job() -> anyhow::Result<()> {
    let store = OutageStore::new();
    let h = harness_on(
        PipesConfig::default().with_num_workers(1),
        Arc::new(store.clone()),
    )
    .await?;
    let job_id = JobId::new();

    store.fail_reads("fetcher:");
    let err = run_request(
        &h,
        JobRequest::new(source_of(work_items(3))).with_job_id(job_id),
    )
    .await
    .unwrap_err();

    assert!(err.is_state_store(), "unexpected error {err}");
    assert!(store.failed_reads() > 0);
    assert_eq!(h.reporter.errors().len(), 1);
    assert_eq!(h.processor.started(), 0);

    // Nothing is charged to the items themselves.
    let statuses = h.reporter.statuses();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.values().all(|status| *status == OutcomeStatus::Cancelled));

    store.restore();
    let status = h.supervisor.tracker().get(job_id).await?.expect("status recorded");
    assert_eq!(status.state(), JobState::CompletedWithErrors);
    Ok(())
}

async fn run_request(h: &Harness, request: JobRequest) -> Result<JobSummary, PipesError> {
    timeout(Duration::from_secs(30), h.supervisor.run(request))
        .await
        .expect("job should finish")
}

#[tokio::test]
async fn job_status_reaches_completed() -> anyhow::Result<()> {
    let h = harness(PipesConfig::default()).await?;
    let job_id = JobId::new();

    let request = JobRequest::new(source_of(work_items(4)))
        .with_job_id(job_id)
        .with_fetcher(sluice_testkit::MOCK_FETCHER_ID)
        .with_emitter(sluice_testkit::MOCK_EMITTER_ID);
    let summary = run_request(&h, request).await?;
    assert_eq!(summary.job_id, job_id);

    let status = h.supervisor.tracker().get(job_id).await?.expect("status recorded");
    assert!(status.completed);
    assert!(!status.running);
    assert!(!status.has_error);
    assert_eq!(status.items_reported, 4);
    assert_eq!(status.state(), JobState::Completed);
    Ok(())
}

#[tokio::test]
async fn supervisors_sharing_a_store_see_registrations_and_jobs() -> anyhow::Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::new());
    let first = harness_on(PipesConfig::default(), Arc::clone(&store)).await?;

    // The second node only registers factories; descriptors come from the store.
    let registry = Arc::new(ExtensionRegistry::new(Arc::clone(&store)));
    let second_extensions = MockExtensions::attach(Arc::clone(&registry));
    let second_reporter = RecordingReporter::new();
    let second = SupervisorBuilder::new(PipesConfig::default())
        .with_registry(registry)
        .with_processor(Arc::new(MockProcessor::new()))
        .with_reporter(Arc::new(second_reporter.clone()))
        .build()?;

    run(&first, work_items(3)).await?;
    second
        .run(JobRequest::new(source_of(work_items(2))).with_fetcher(sluice_testkit::MOCK_FETCHER_ID))
        .await?;

    assert_eq!(second_reporter.count(OutcomeStatus::Success), 2);
    second_extensions.emitter.assert_emit_count_eq(2);

    let jobs = first.supervisor.tracker().list_jobs().await?;
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.state() == JobState::Completed));
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_running_jobs() -> anyhow::Result<()> {
    let config = PipesConfig::default()
        .with_num_workers(1)
        .with_shutdown_grace(50);
    let h = harness(config).await?;

    let handle = h
        .supervisor
        .submit(JobRequest::new(source_of(vec![work_item("stuck", "hang")])));
    assert!(h.processor.wait_until_started(1, Duration::from_secs(5)).await);

    h.supervisor.shutdown().await;
    let summary = timeout(Duration::from_secs(10), handle.wait()).await??;
    assert!(summary.cancelled);
    assert_eq!(h.reporter.statuses()["stuck"], OutcomeStatus::Cancelled);

    let err = h
        .supervisor
        .run(JobRequest::new(source_of(work_items(1))))
        .await
        .unwrap_err();
    assert!(matches!(err, PipesError::Cancelled(_)));
    Ok(())
}
