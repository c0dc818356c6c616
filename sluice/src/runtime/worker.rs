use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::PipesError;
use crate::extension::{ByteStream, ExtensionRegistry};
use crate::item::{Metadata, OnFailurePolicy, WorkItem};
use crate::outcome::{Outcome, OutcomeStatus};

/// What the processing stage produced for one item.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessOutput {
    /// One metadata object per extracted document (container plus embedded).
    pub metadata: Vec<Metadata>,
    /// Recoverable exception raised part-way through. `metadata` then holds
    /// whatever was extracted before it.
    pub exception: Option<String>,
}

impl ProcessOutput {
    pub fn new(metadata: Vec<Metadata>) -> Self {
        Self {
            metadata,
            exception: None,
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

/// Content extraction. Runs inside an execution context and may hang, panic,
/// or take the whole process down; the supervisor contains all three.
///
/// An `Err` is treated the same as an output with an exception and no
/// metadata.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, content: ByteStream, metadata: &Metadata) -> anyhow::Result<ProcessOutput>;
}

/// Anything that turns one work item into exactly one outcome.
///
/// `Err` is reserved for failures that make the whole job unrunnable, such
/// as the state store giving up; everything item-specific is an outcome.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> Result<Outcome, PipesError>;
}

/// Immutable per-process state for a processor (parsers, detectors, models),
/// built once on first use and shared by every item afterwards.
pub struct ProcessingModel<T> {
    cell: OnceCell<Arc<T>>,
}

impl<T> fmt::Debug for ProcessingModel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingModel")
            .field("initialized", &self.cell.initialized())
            .finish()
    }
}

impl<T> Default for ProcessingModel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ProcessingModel<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Return the model, running `init` if no caller has built it yet.
    /// Concurrent callers wait for the same initialization; a failed `init`
    /// leaves the model empty so a later call can retry.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> anyhow::Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.cell
            .get_or_try_init(|| async { init().await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

/// Fetch, process and emit one work item at a time.
#[derive(Clone)]
pub struct PipesWorker {
    registry: Arc<ExtensionRegistry>,
    processor: Arc<dyn Processor>,
}

impl fmt::Debug for PipesWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipesWorker")
            .field("registry", &self.registry)
            .finish()
    }
}

impl PipesWorker {
    pub fn new(registry: Arc<ExtensionRegistry>, processor: Arc<dyn Processor>) -> Self {
        Self {
            registry,
            processor,
        }
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// Run the full pipeline for `item`. Every item-level problem becomes
    /// the item's outcome status; only a state store failure is an `Err`.
    pub async fn process(&self, item: &WorkItem) -> Result<Outcome, PipesError> {
        let started = Instant::now();
        let outcome = self.run(item).await?;
        Ok(outcome.with_elapsed_ms(started.elapsed().as_millis() as u64))
    }

    async fn run(&self, item: &WorkItem) -> Result<Outcome, PipesError> {
        let content = match self.fetch(item).await {
            Ok(content) => content,
            Err(StageError::Store(err)) => return Err(err),
            Err(StageError::Item(message)) => {
                return Ok(Outcome::failure(
                    item.id.clone(),
                    OutcomeStatus::FetchFailure,
                    message,
                ))
            }
        };

        let output = match self.processor.process(content, &item.metadata).await {
            Ok(output) => output,
            Err(err) => ProcessOutput::default().with_exception(format!("{err:#}")),
        };

        if let Some(exception) = &output.exception {
            tracing::debug!(item_id = %item.id, "processing raised: {exception}");
        }

        let should_emit =
            output.exception.is_none() || item.on_failure == OnFailurePolicy::Emit;
        if should_emit {
            match self.emit(item, &output.metadata).await {
                Ok(()) => {}
                Err(StageError::Store(err)) => return Err(err),
                Err(StageError::Item(message)) => {
                    return Ok(
                        Outcome::failure(item.id.clone(), OutcomeStatus::EmitFailure, message)
                            .with_result_metadata(output.metadata),
                    )
                }
            }
        }

        Ok(match output.exception {
            Some(exception) => {
                Outcome::failure(item.id.clone(), OutcomeStatus::ProcessException, exception)
                    .with_result_metadata(output.metadata)
            }
            None => Outcome::success(item.id.clone(), output.metadata),
        })
    }

    async fn fetch(&self, item: &WorkItem) -> Result<ByteStream, StageError> {
        let fetcher = self.registry.fetcher(item.fetcher_id()).await?;
        fetcher
            .fetch(&item.fetch_key.fetch_key, &item.metadata)
            .await
            .map_err(|err| {
                StageError::Item(format!(
                    "fetch of `{}` failed: {err:#}",
                    item.fetch_key.fetch_key
                ))
            })
    }

    async fn emit(&self, item: &WorkItem, metadata: &[Metadata]) -> Result<(), StageError> {
        let emitter = self.registry.emitter(item.emitter_id()).await?;
        emitter
            .emit(&item.emit_key.emit_key, metadata)
            .await
            .map_err(|err| {
                StageError::Item(format!("emit to `{}` failed: {err:#}", item.emit_key.emit_key))
            })
    }
}

/// Why a fetch or emit stage did not complete.
enum StageError {
    /// Charged to the item.
    Item(String),
    /// The registry could not reach the state store.
    Store(PipesError),
}

impl From<PipesError> for StageError {
    fn from(err: PipesError) -> Self {
        if err.is_state_store() {
            StageError::Store(err)
        } else {
            StageError::Item(err.to_string())
        }
    }
}

#[async_trait]
impl ItemHandler for PipesWorker {
    async fn handle(&self, item: &WorkItem) -> Result<Outcome, PipesError> {
        self.process(item).await
    }
}
