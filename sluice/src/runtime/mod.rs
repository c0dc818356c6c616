/// Builder for constructing supervisors.
pub mod builder;
/// Line protocol spoken between the supervisor and child worker processes.
pub mod child;
/// Isolation boundaries a worker slot runs items in.
pub mod context;
/// Job dispatch, watchdog, and cancellation.
pub mod supervisor;
/// The fetch, process, emit pipeline for a single item.
pub mod worker;

pub use builder::SupervisorBuilder;
pub use child::{serve, serve_stdio, WorkerRequest, WorkerResponse};
pub use context::{ChildProcessContext, ExecutionContext, ExecutionResult, InProcessContext};
pub use supervisor::{JobHandle, JobRequest, JobSummary, ShutdownToken, Supervisor};
pub use worker::{ItemHandler, PipesWorker, ProcessOutput, Processor, ProcessingModel};
