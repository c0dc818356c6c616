//! Sluice - crash-isolated fetch, process, emit orchestration.
//!
//! Sluice drives a stream of work items through a fixed pool of worker slots.
//! Each item is fetched through a named fetcher, handed to a processor for
//! content extraction, and the resulting metadata is written through a named
//! emitter. Processors are assumed to be hostile: they may hang, panic, or
//! bring down the process they run in. The supervisor contains all three and
//! turns every item into exactly one reported outcome.
//!
//! # Core Concepts
//!
//! - **Work item**: A [`WorkItem`] names what to fetch ([`FetchKey`]), where to
//!   emit ([`EmitKey`]), and carries user [`Metadata`].
//!
//! - **Outcome**: Every dispatched item yields one [`Outcome`] with an
//!   [`OutcomeStatus`]. Per-item failures never abort the job.
//!
//! - **Extensions**: [`Fetcher`]s and [`Emitter`]s are created by registered
//!   factories from descriptors saved in the [`ExtensionRegistry`], which keeps
//!   them in a [`StateStore`] shared by every supervisor attached to it.
//!
//! - **Isolation**: Each worker slot owns an [`ExecutionContext`], either an
//!   [`InProcessContext`] or a [`ChildProcessContext`] speaking the JSON line
//!   protocol in [`runtime::child`].
//!
//! - **Supervisor**: The [`Supervisor`] pulls items from a [`PipesIterator`],
//!   enforces the per-item timeout, restarts crashed contexts, and reports to a
//!   [`PipesReporter`]. Job lifecycle is tracked in the state store by
//!   [`JobStatusTracker`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL state store via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use sluice::*;
//!
//! let config = PipesConfig::default().with_num_workers(8);
//! let registry = Arc::new(ExtensionRegistry::connect(&config.state_store, config.store_retry).await?);
//! registry.register_fetcher_factory(Arc::new(FsFetcherFactory));
//! registry.save_fetcher(&ExtensionDescriptor::fetcher("fs", "fs", json!({"base": "/data"}))).await?;
//!
//! let supervisor = SupervisorBuilder::new(config)
//!     .with_registry(registry)
//!     .with_processor(Arc::new(MyProcessor))
//!     .build()?;
//! let summary = supervisor.run(JobRequest::new(VecSource::new(items)).with_fetcher("fs")).await?;
//! ```

/// Pipeline configuration.
///
/// [`PipesConfig`] holds worker count, timeouts, intake capacity, the
/// isolation mode, and the state store descriptor.
pub mod config;

/// Job-level error type.
pub mod error;

/// Fetcher, emitter, and source extensions and the registry that owns them.
pub mod extension;

/// Work items and their metadata.
pub mod item;

/// Durable job lifecycle tracking.
pub mod job_status;

#[cfg(feature = "metrics")]
/// Prometheus collectors.
pub mod metrics;

/// Per-item outcomes.
pub mod outcome;

/// Outcome reporting.
///
/// The [`PipesReporter`] trait receives every outcome. Includes
/// [`LoggingReporter`], [`CompositeReporter`], and [`FilteringReporter`].
pub mod reporter;

/// Bounded retry for state store operations.
pub mod retry;

/// Supervisor, worker slots, and the child process protocol.
///
/// The `runtime` module provides:
/// - [`Supervisor`] and [`SupervisorBuilder`] - job dispatch
/// - [`ExecutionContext`] - the isolation boundary of one worker slot
/// - [`PipesWorker`] and [`Processor`] - the per-item pipeline
/// - [`ShutdownToken`] - cancellation signaling
pub mod runtime;

/// Work item sources.
pub mod source;

/// Namespaced key/value state stores.
pub mod state;

/// Tracing spans and outcome recording.
pub mod telemetry;

pub use config::*;
pub use error::PipesError;
pub use extension::*;
pub use item::*;
pub use job_status::*;
pub use outcome::*;
pub use reporter::*;
pub use retry::*;
pub use runtime::*;
pub use source::*;
pub use state::{create_state_store, LocalStateStore, Namespace, StateStore};
