//! Child worker for process-isolation tests.
//!
//! Speaks the sluice line protocol on stdin/stdout with the mock fetcher,
//! emitter and processor. A fetched body of `exit` terminates the process
//! with status 3 mid-item. Logs go to stderr, filtered by `RUST_LOG`.

use std::sync::Arc;

use async_trait::async_trait;
use sluice::*;
use sluice_testkit::{MockExtensions, MockProcessor};
use tokio::io::AsyncReadExt;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

struct ExitingProcessor {
    inner: MockProcessor,
}

#[async_trait]
impl Processor for ExitingProcessor {
    async fn process(&self, mut content: ByteStream, metadata: &Metadata) -> anyhow::Result<ProcessOutput> {
        let mut body = Vec::new();
        content.read_to_end(&mut body).await?;
        if body == b"exit" {
            tracing::warn!("exiting mid-item");
            std::process::exit(3);
        }
        self.inner
            .process(Box::pin(std::io::Cursor::new(body)), metadata)
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let extensions = MockExtensions::local().await?;
    let worker = PipesWorker::new(
        Arc::clone(&extensions.registry),
        Arc::new(ExitingProcessor {
            inner: MockProcessor::new(),
        }),
    );

    serve_stdio(&worker)
        .instrument(telemetry::child_span(std::process::id()))
        .await?;
    Ok(())
}
