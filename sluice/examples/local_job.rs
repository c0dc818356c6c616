//! Run a small job against an in-memory state store.
//!
//! Registers a directory fetcher and a stdout emitter, then pushes every file
//! under the given directory (default: the current directory) through a
//! processor that counts lines and words.
//!
//! ```text
//! RUST_LOG=sluice=debug cargo run --example local_job -- ./src
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use sluice::*;
use tokio::io::AsyncReadExt;

#[derive(Deserialize)]
struct DirFetcherConfig {
    base: PathBuf,
}

/// Reads fetch keys as paths relative to a base directory.
struct DirFetcher {
    base: PathBuf,
}

#[async_trait]
impl Extension for DirFetcher {
    async fn is_available(&self) -> bool {
        self.base.is_dir()
    }
}

#[async_trait]
impl Fetcher for DirFetcher {
    async fn fetch(&self, fetch_key: &str, _metadata: &Metadata) -> anyhow::Result<ByteStream> {
        let path = self.base.join(fetch_key);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Box::pin(file))
    }
}

struct DirFetcherFactory;

impl ExtensionFactory<dyn Fetcher> for DirFetcherFactory {
    fn plugin_id(&self) -> &str {
        "dir"
    }

    fn create(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Fetcher>> {
        let config: DirFetcherConfig = serde_json::from_value(config.clone())?;
        Ok(Arc::new(DirFetcher { base: config.base }))
    }
}

/// Prints emitted metadata as JSON lines.
struct StdoutEmitter;

#[async_trait]
impl Extension for StdoutEmitter {}

#[async_trait]
impl Emitter for StdoutEmitter {
    async fn emit(&self, emit_key: &str, metadata: &[Metadata]) -> anyhow::Result<()> {
        for document in metadata {
            println!("{emit_key}\t{}", serde_json::to_string(document)?);
        }
        Ok(())
    }
}

struct StdoutEmitterFactory;

impl ExtensionFactory<dyn Emitter> for StdoutEmitterFactory {
    fn plugin_id(&self) -> &str {
        "stdout"
    }

    fn create(&self, _config: &serde_json::Value) -> anyhow::Result<Arc<dyn Emitter>> {
        Ok(Arc::new(StdoutEmitter))
    }
}

struct WordCount;

#[async_trait]
impl Processor for WordCount {
    async fn process(&self, mut content: ByteStream, _metadata: &Metadata) -> anyhow::Result<ProcessOutput> {
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes).await?;
        let text = String::from_utf8_lossy(&bytes);

        let mut metadata = Metadata::new();
        metadata.set("bytes", bytes.len().to_string());
        metadata.set("lines", text.lines().count().to_string());
        metadata.set("words", text.split_whitespace().count().to_string());
        Ok(ProcessOutput::new(vec![metadata]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let base = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = PipesConfig::default().with_num_workers(2).with_per_item_timeout(5_000);
    let registry = Arc::new(ExtensionRegistry::connect(&config.state_store, config.store_retry).await?);
    registry.register_fetcher_factory(Arc::new(DirFetcherFactory));
    registry.register_emitter_factory(Arc::new(StdoutEmitterFactory));
    registry
        .save_fetcher("dir", ExtensionDescriptor::fetcher("dir", serde_json::json!({ "base": base })))
        .await?;
    registry
        .save_emitter("stdout", ExtensionDescriptor::emitter("stdout", serde_json::Value::Null))
        .await?;

    let mut items = Vec::new();
    let mut entries = tokio::fs::read_dir(&base).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            items.push(WorkItem::new(
                name.clone(),
                FetchKey::new("dir", name.clone()),
                EmitKey::new("stdout", name),
            ));
        }
    }

    let supervisor = SupervisorBuilder::new(config)
        .with_registry(registry)
        .with_processor(Arc::new(WordCount))
        .build()?;

    let summary = supervisor
        .run(
            JobRequest::new(VecSource::new(items))
                .with_fetcher("dir")
                .with_emitter("stdout"),
        )
        .await?;

    eprintln!(
        "{} items in {}ms: {:?}",
        summary.total(),
        summary.elapsed_ms,
        summary.state
    );
    Ok(())
}
