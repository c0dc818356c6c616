//! Isolation boundaries a worker slot runs items in.

use std::any::Any;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::AbortHandle;

use crate::config::ChildProcessConfig;
use crate::error::PipesError;
use crate::item::WorkItem;
use crate::outcome::Outcome;

use super::child::{read_message, write_message, WorkerRequest, WorkerResponse};
use super::worker::ItemHandler;

/// How an execution ended, as seen from the supervisor.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The worker produced an outcome.
    Completed(Outcome),
    /// The context died before producing one.
    Crashed { reason: String },
    /// The worker hit a failure that stops the whole job.
    Fatal(PipesError),
}

/// One worker slot's isolation boundary.
///
/// `execute` may be abandoned part-way (the supervisor drops its future on
/// timeout or cancellation); `terminate` must then leave the context ready to
/// start fresh on the next `execute`.
#[async_trait]
pub trait ExecutionContext: Send {
    async fn execute(&mut self, item: &WorkItem) -> ExecutionResult;

    /// Forcibly stop whatever is running.
    async fn terminate(&mut self);

    /// Release the context at the end of a job.
    async fn close(&mut self) {
        self.terminate().await;
    }
}

/// Runs each item on its own tokio task.
///
/// Panics are contained and timeouts abort the task, but a processor that
/// blocks its runtime thread or aborts the process takes the supervisor with
/// it.
pub struct InProcessContext {
    handler: Arc<dyn ItemHandler>,
    running: Option<AbortHandle>,
}

impl fmt::Debug for InProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessContext")
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl InProcessContext {
    pub fn new(handler: Arc<dyn ItemHandler>) -> Self {
        Self {
            handler,
            running: None,
        }
    }
}

#[async_trait]
impl ExecutionContext for InProcessContext {
    async fn execute(&mut self, item: &WorkItem) -> ExecutionResult {
        let handler = Arc::clone(&self.handler);
        let item = item.clone();
        let task = tokio::spawn(async move { handler.handle(&item).await });
        self.running = Some(task.abort_handle());

        let result = task.await;
        self.running = None;

        match result {
            Ok(Ok(outcome)) => ExecutionResult::Completed(outcome),
            Ok(Err(err)) => ExecutionResult::Fatal(err),
            Err(err) if err.is_panic() => ExecutionResult::Crashed {
                reason: format!("worker panicked: {}", panic_message(err.into_panic())),
            },
            Err(_) => ExecutionResult::Crashed {
                reason: "worker task was aborted".to_string(),
            },
        }
    }

    async fn terminate(&mut self) {
        if let Some(task) = self.running.take() {
            task.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct RunningChild {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pid: u32,
    served: u64,
}

/// Runs items in a dedicated worker executable, one at a time.
///
/// The child is started lazily, recycled after `max_items_per_process`
/// items, and killed on timeout or any protocol failure. A killed child is
/// replaced on the next `execute`.
pub struct ChildProcessContext {
    config: ChildProcessConfig,
    child: Option<RunningChild>,
}

impl fmt::Debug for ChildProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcessContext")
            .field("program", &self.config.program)
            .field("pid", &self.pid())
            .finish()
    }
}

impl ChildProcessContext {
    pub fn new(config: ChildProcessConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    /// Pid of the live child, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.pid)
    }

    /// Items served by the live child.
    pub fn served(&self) -> u64 {
        self.child.as_ref().map_or(0, |child| child.served)
    }

    /// Start the child if needed and check it answers.
    pub async fn ping(&mut self) -> Result<(), PipesError> {
        if self.child.is_none() {
            self.start().await?;
        }
        let Some(child) = self.child.as_mut() else {
            return Err(PipesError::Protocol("worker is not running".to_string()));
        };

        let answer = async {
            write_message(&mut child.stdin, &WorkerRequest::Ping).await?;
            read_message::<_, WorkerResponse>(&mut child.stdout).await
        }
        .await;

        match answer {
            Ok(Some(WorkerResponse::Pong)) => Ok(()),
            Ok(other) => {
                self.kill().await;
                Err(PipesError::Protocol(format!("expected pong, got {other:?}")))
            }
            Err(err) => {
                self.kill().await;
                Err(err)
            }
        }
    }

    async fn start(&mut self) -> Result<(), PipesError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = command.spawn()?;
        let (Some(stdin), Some(stdout)) = (process.stdin.take(), process.stdout.take()) else {
            let _ = process.kill().await;
            return Err(PipesError::Protocol("worker stdio was not captured".to_string()));
        };
        let mut stdout = BufReader::new(stdout);

        let handshake = tokio::time::timeout(
            self.config.startup_timeout(),
            read_message::<_, WorkerResponse>(&mut stdout),
        )
        .await;

        let failure = match handshake {
            Ok(Ok(Some(WorkerResponse::Ready { pid }))) => {
                tracing::info!(program = %self.config.program, pid, "worker started");
                self.child = Some(RunningChild {
                    process,
                    stdin,
                    stdout,
                    pid,
                    served: 0,
                });
                return Ok(());
            }
            Ok(Ok(Some(other))) => format!("expected ready, got {other:?}"),
            Ok(Ok(None)) => "worker exited during startup".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!(
                "worker not ready within {}ms",
                self.config.startup_timeout_ms
            ),
        };

        drop(stdin);
        let status = reap(&mut process).await;
        Err(PipesError::Protocol(describe_exit(failure, status)))
    }

    /// Ask the child to exit, killing it if it does not within the shutdown
    /// timeout.
    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if write_message(&mut child.stdin, &WorkerRequest::Shutdown).await.is_ok() {
            drop(child.stdin);
            match tokio::time::timeout(self.config.shutdown_timeout(), child.process.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(pid = child.pid, served = child.served, %status, "worker exited");
                    return;
                }
                Ok(Err(err)) => tracing::warn!(pid = child.pid, "waiting for worker failed: {err}"),
                Err(_) => tracing::warn!(pid = child.pid, "worker ignored shutdown request"),
            }
        }
        reap(&mut child.process).await;
    }

    /// Kill the child and return its exit status.
    async fn kill(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        drop(child.stdin);
        let status = reap(&mut child.process).await;
        tracing::debug!(pid = child.pid, served = child.served, ?status, "worker killed");
        status
    }

    async fn exchange(child: &mut RunningChild, item: &WorkItem) -> Result<ExecutionResult, String> {
        write_message(
            &mut child.stdin,
            &WorkerRequest::Process { item: item.clone() },
        )
        .await
        .map_err(|err| format!("failed to hand item to worker: {err}"))?;

        loop {
            match read_message::<_, WorkerResponse>(&mut child.stdout).await {
                Ok(Some(WorkerResponse::Finished { outcome })) => {
                    child.served += 1;
                    if outcome.item_id != item.id {
                        return Err(format!(
                            "worker answered for `{}` while processing `{}`",
                            outcome.item_id, item.id
                        ));
                    }
                    return Ok(ExecutionResult::Completed(outcome));
                }
                Ok(Some(WorkerResponse::Failed { item_id, message })) => {
                    child.served += 1;
                    tracing::warn!(pid = child.pid, item_id = %item_id, "worker failed: {message}");
                    return Ok(ExecutionResult::Fatal(PipesError::Worker(message)));
                }
                Ok(Some(other)) => {
                    tracing::debug!(pid = child.pid, "ignoring stray {other:?}");
                }
                Ok(None) => return Err("worker exited without finishing".to_string()),
                Err(err) => return Err(err.to_string()),
            }
        }
    }
}

#[async_trait]
impl ExecutionContext for ChildProcessContext {
    async fn execute(&mut self, item: &WorkItem) -> ExecutionResult {
        if self.served() >= self.config.max_items_per_process {
            tracing::debug!(pid = ?self.pid(), "recycling worker");
            self.stop().await;
        }

        if self.child.is_none() {
            if let Err(err) = self.start().await {
                return ExecutionResult::Crashed {
                    reason: format!("worker failed to start: {err}"),
                };
            }
        }

        let exchanged = match self.child.as_mut() {
            Some(child) => Self::exchange(child, item).await,
            None => Err("worker is not running".to_string()),
        };

        match exchanged {
            Ok(result) => result,
            Err(reason) => {
                let status = self.kill().await;
                ExecutionResult::Crashed {
                    reason: describe_exit(reason, status),
                }
            }
        }
    }

    async fn terminate(&mut self) {
        self.kill().await;
    }

    async fn close(&mut self) {
        self.stop().await;
    }
}

async fn reap(process: &mut Child) -> Option<ExitStatus> {
    match process.try_wait() {
        Ok(Some(status)) => Some(status),
        _ => {
            if let Err(err) = process.kill().await {
                tracing::warn!("failed to kill worker: {err}");
            }
            process.wait().await.ok()
        }
    }
}

fn describe_exit(reason: String, status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!("{reason} ({status})"),
        None => reason,
    }
}
