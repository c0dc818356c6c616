//! Line protocol between a supervisor and a child worker process.
//!
//! Each message is one JSON object per line. The child announces `ready` once
//! after startup, then answers every `process` with exactly one `finished`
//! (or `failed`, when the job itself cannot go on) and every `ping` with
//! `pong`. Stdout is reserved for the protocol; child
//! logging goes to stderr.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::PipesError;
use crate::item::{ItemId, WorkItem};
use crate::outcome::Outcome;

use super::worker::ItemHandler;

/// Supervisor to child.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Process { item: WorkItem },
    Ping,
    Shutdown,
}

/// Child to supervisor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready { pid: u32 },
    Pong,
    Finished { outcome: Outcome },
    /// Job-level failure while handling `item_id`, such as the state store
    /// giving up. The item has no outcome.
    Failed { item_id: ItemId, message: String },
}

pub(crate) async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), PipesError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next non-blank line and decode it. `Ok(None)` means EOF.
pub(crate) async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, PipesError>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|err| PipesError::Protocol(format!("undecodable message `{trimmed}`: {err}")));
    }
}

/// Serve the worker protocol until `shutdown` or EOF.
pub async fn serve<R, W>(reader: R, mut writer: W, handler: &dyn ItemHandler) -> Result<(), PipesError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = reader;
    write_message(
        &mut writer,
        &WorkerResponse::Ready {
            pid: std::process::id(),
        },
    )
    .await?;

    let mut served: u64 = 0;
    loop {
        let request = match read_message::<_, WorkerRequest>(&mut reader).await? {
            Some(request) => request,
            None => {
                tracing::info!(served, "supervisor closed the channel");
                return Ok(());
            }
        };

        match request {
            WorkerRequest::Process { item } => {
                tracing::debug!(item_id = %item.id, "processing");
                let response = match handler.handle(&item).await {
                    Ok(outcome) => WorkerResponse::Finished { outcome },
                    Err(err) => {
                        tracing::error!(item_id = %item.id, "job-level failure: {err}");
                        WorkerResponse::Failed {
                            item_id: item.id,
                            message: err.to_string(),
                        }
                    }
                };
                served += 1;
                write_message(&mut writer, &response).await?;
            }
            WorkerRequest::Ping => write_message(&mut writer, &WorkerResponse::Pong).await?,
            WorkerRequest::Shutdown => {
                tracing::info!(served, "shutdown requested");
                return Ok(());
            }
        }
    }
}

/// Serve the worker protocol over this process's stdin and stdout.
pub async fn serve_stdio(handler: &dyn ItemHandler) -> Result<(), PipesError> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    serve(reader, writer, handler).await
}
