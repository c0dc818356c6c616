use async_trait::async_trait;
use parking_lot::Mutex;
use sluice::*;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

pub const MOCK_PLUGIN_ID: &str = "mock";
pub const MOCK_FETCHER_ID: &str = "mock-fetcher";
pub const MOCK_EMITTER_ID: &str = "mock-emitter";

/// Fetch keys starting with this prefix fail to fetch.
pub const MISSING_PREFIX: &str = "missing";

/// In-memory fetcher. Serves registered documents, fails keys that start with
/// [`MISSING_PREFIX`], and echoes every other key back as the body.
#[derive(Clone, Default)]
pub struct MockFetcher {
    documents: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fetch_key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.documents.lock().insert(fetch_key.into(), body.into());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl Extension for MockFetcher {}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, fetch_key: &str, _metadata: &Metadata) -> anyhow::Result<ByteStream> {
        self.fetched.lock().push(fetch_key.to_string());
        if fetch_key.starts_with(MISSING_PREFIX) {
            anyhow::bail!("no document at `{fetch_key}`");
        }
        let body = self
            .documents
            .lock()
            .get(fetch_key)
            .cloned()
            .unwrap_or_else(|| fetch_key.as_bytes().to_vec());
        Ok(Box::pin(Cursor::new(body)))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EmitRecord {
    pub emit_key: String,
    pub metadata: Vec<Metadata>,
}

/// Records every emit. Keys registered with [`MockEmitter::fail_on`] fail.
#[derive(Clone, Default)]
pub struct MockEmitter {
    emitted: Arc<Mutex<Vec<EmitRecord>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MockEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, emit_key: impl Into<String>) {
        self.failing.lock().insert(emit_key.into());
    }

    pub fn emitted(&self) -> Vec<EmitRecord> {
        self.emitted.lock().clone()
    }

    pub fn emitted_keys(&self) -> Vec<String> {
        self.emitted
            .lock()
            .iter()
            .map(|record| record.emit_key.clone())
            .collect()
    }

    pub fn assert_emit_count_eq(&self, expected: usize) {
        let actual = self.emitted.lock().len();
        assert_eq!(actual, expected, "Expected {expected} emits, got {actual}");
    }
}

#[async_trait]
impl Extension for MockEmitter {}

#[async_trait]
impl Emitter for MockEmitter {
    async fn emit(&self, emit_key: &str, metadata: &[Metadata]) -> anyhow::Result<()> {
        if self.failing.lock().contains(emit_key) {
            anyhow::bail!("emitter rejected `{emit_key}`");
        }
        self.emitted.lock().push(EmitRecord {
            emit_key: emit_key.to_string(),
            metadata: metadata.to_vec(),
        });
        Ok(())
    }
}

/// Hands out the same [`MockFetcher`] for every descriptor so tests can
/// inspect it. The descriptor's `documents` object, if any, is loaded into it.
pub struct MockFetcherFactory {
    fetcher: MockFetcher,
}

impl MockFetcherFactory {
    pub fn new(fetcher: MockFetcher) -> Self {
        Self { fetcher }
    }
}

impl ExtensionFactory<dyn Fetcher> for MockFetcherFactory {
    fn plugin_id(&self) -> &str {
        MOCK_PLUGIN_ID
    }

    fn create(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Fetcher>> {
        if let Some(documents) = config.get("documents") {
            let documents: HashMap<String, String> = serde_json::from_value(documents.clone())?;
            for (key, body) in documents {
                self.fetcher.insert(key, body);
            }
        }
        Ok(Arc::new(self.fetcher.clone()))
    }
}

pub struct MockEmitterFactory {
    emitter: MockEmitter,
}

impl MockEmitterFactory {
    pub fn new(emitter: MockEmitter) -> Self {
        Self { emitter }
    }
}

impl ExtensionFactory<dyn Emitter> for MockEmitterFactory {
    fn plugin_id(&self) -> &str {
        MOCK_PLUGIN_ID
    }

    fn create(&self, _config: &serde_json::Value) -> anyhow::Result<Arc<dyn Emitter>> {
        Ok(Arc::new(self.emitter.clone()))
    }
}

/// A registry with the mock fetcher and emitter registered and saved under
/// [`MOCK_FETCHER_ID`] and [`MOCK_EMITTER_ID`].
#[derive(Clone)]
pub struct MockExtensions {
    pub registry: Arc<ExtensionRegistry>,
    pub fetcher: MockFetcher,
    pub emitter: MockEmitter,
}

impl MockExtensions {
    /// Install on a fresh in-memory store.
    pub async fn local() -> anyhow::Result<Self> {
        Self::install(Arc::new(LocalStateStore::new())).await
    }

    pub async fn install(store: Arc<dyn StateStore>) -> anyhow::Result<Self> {
        let registry = Arc::new(ExtensionRegistry::new(store));
        let extensions = Self::attach(registry);
        extensions
            .registry
            .save_fetcher(
                MOCK_FETCHER_ID,
                ExtensionDescriptor::fetcher(MOCK_PLUGIN_ID, serde_json::Value::Null),
            )
            .await?;
        extensions
            .registry
            .save_emitter(
                MOCK_EMITTER_ID,
                ExtensionDescriptor::emitter(MOCK_PLUGIN_ID, serde_json::Value::Null),
            )
            .await?;
        Ok(extensions)
    }

    /// Register mock factories on an existing registry without saving any
    /// descriptors.
    pub fn attach(registry: Arc<ExtensionRegistry>) -> Self {
        let fetcher = MockFetcher::new();
        let emitter = MockEmitter::new();
        registry.register_fetcher_factory(Arc::new(MockFetcherFactory::new(fetcher.clone())));
        registry.register_emitter_factory(Arc::new(MockEmitterFactory::new(emitter.clone())));
        Self {
            registry,
            fetcher,
            emitter,
        }
    }
}
