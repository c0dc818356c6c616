//! Named fetchers, emitters and sources, materialized from JSON descriptors.
//!
//! Descriptors live in the shared [`StateStore`] under `fetcher:<id>` and
//! `emitter:<id>`, so a registration saved on one node is resolvable on every
//! node that shares the backend. Each node keeps its own cache of live
//! instances, keyed by id and invalidated when the stored descriptor changes.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::PipesError;
use crate::item::Metadata;
use crate::retry::{with_retries, StoreRetryConfig};
use crate::source::PipesIterator;
use crate::state::{create_state_store, Namespace, StateStore};

/// Raw content handed from a fetcher to the processing stage.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    Fetcher,
    Emitter,
    StateStore,
    Source,
}

impl ExtensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionKind::Fetcher => "fetcher",
            ExtensionKind::Emitter => "emitter",
            ExtensionKind::StateStore => "statestore",
            ExtensionKind::Source => "source",
        }
    }
}

impl Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to build a live extension instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub plugin_id: String,
    pub kind: ExtensionKind,
    #[serde(default)]
    pub config_json: serde_json::Value,
}

impl ExtensionDescriptor {
    pub fn new(
        plugin_id: impl Into<String>,
        kind: ExtensionKind,
        config_json: serde_json::Value,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            kind,
            config_json,
        }
    }

    pub fn fetcher(plugin_id: impl Into<String>, config_json: serde_json::Value) -> Self {
        Self::new(plugin_id, ExtensionKind::Fetcher, config_json)
    }

    pub fn emitter(plugin_id: impl Into<String>, config_json: serde_json::Value) -> Self {
        Self::new(plugin_id, ExtensionKind::Emitter, config_json)
    }

    pub fn source(plugin_id: impl Into<String>, config_json: serde_json::Value) -> Self {
        Self::new(plugin_id, ExtensionKind::Source, config_json)
    }
}

/// Capability probe shared by every extension.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Whether the extension can run in this environment (credentials
    /// present, native library loadable, endpoint reachable...).
    async fn is_available(&self) -> bool {
        true
    }
}

/// Retrieves raw content for a fetch key.
#[async_trait]
pub trait Fetcher: Extension {
    async fn fetch(&self, fetch_key: &str, metadata: &Metadata) -> anyhow::Result<ByteStream>;
}

/// Persists processing results under an emit key.
#[async_trait]
pub trait Emitter: Extension {
    async fn emit(&self, emit_key: &str, metadata: &[Metadata]) -> anyhow::Result<()>;
}

/// Builds shared extension instances of type `T` from a descriptor's JSON.
pub trait ExtensionFactory<T: ?Sized>: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn create(&self, config: &serde_json::Value) -> anyhow::Result<Arc<T>>;
}

/// Builds a fresh source for each job.
pub trait SourceFactory: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn create(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PipesIterator>>;
}

pub type FetcherFactory = dyn ExtensionFactory<dyn Fetcher>;
pub type EmitterFactory = dyn ExtensionFactory<dyn Emitter>;

struct LiveExtension<T: ?Sized> {
    descriptor: ExtensionDescriptor,
    instance: Arc<T>,
}

/// Factories plus cached instances for one extension kind.
struct Catalog<T: ?Sized> {
    namespace: Namespace,
    kind: ExtensionKind,
    factories: RwLock<HashMap<String, Arc<dyn ExtensionFactory<T>>>>,
    live: RwLock<HashMap<String, LiveExtension<T>>>,
}

impl<T> Catalog<T>
where
    T: Extension + ?Sized,
{
    fn new(namespace: Namespace, kind: ExtensionKind) -> Self {
        Self {
            namespace,
            kind,
            factories: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, factory: Arc<dyn ExtensionFactory<T>>) {
        let plugin_id = factory.plugin_id().to_string();
        if self.factories.write().insert(plugin_id.clone(), factory).is_some() {
            tracing::warn!(kind = %self.kind, plugin_id = %plugin_id, "replacing extension factory");
        }
    }

    fn has_factory(&self, plugin_id: &str) -> bool {
        self.factories.read().contains_key(plugin_id)
    }

    fn cached(&self, id: &str, descriptor: &ExtensionDescriptor) -> Option<Arc<T>> {
        self.live
            .read()
            .get(id)
            .filter(|live| &live.descriptor == descriptor)
            .map(|live| Arc::clone(&live.instance))
    }

    fn invalidate(&self, id: &str) {
        self.live.write().remove(id);
    }

    async fn materialize(
        &self,
        id: &str,
        descriptor: ExtensionDescriptor,
    ) -> Result<Arc<T>, PipesError> {
        let factory = self
            .factories
            .read()
            .get(&descriptor.plugin_id)
            .cloned()
            .ok_or_else(|| {
                PipesError::config(format!(
                    "{} `{id}` uses unknown plugin `{}`",
                    self.kind, descriptor.plugin_id
                ))
            })?;

        let instance = factory.create(&descriptor.config_json).map_err(|err| {
            PipesError::config(format!("{} `{id}` could not be created: {err:#}", self.kind))
        })?;

        if !instance.is_available().await {
            return Err(PipesError::config(format!(
                "{} `{id}` (plugin `{}`) is not available in this environment",
                self.kind, descriptor.plugin_id
            )));
        }

        tracing::debug!(kind = %self.kind, id, plugin_id = %descriptor.plugin_id, "materialized extension");
        self.live.write().insert(
            id.to_string(),
            LiveExtension {
                descriptor,
                instance: Arc::clone(&instance),
            },
        );
        Ok(instance)
    }
}

/// Resolves fetchers and emitters by id, sharing one live instance per id
/// across all workers and jobs in the process.
pub struct ExtensionRegistry {
    store: Arc<dyn StateStore>,
    retry: StoreRetryConfig,
    fetchers: Catalog<dyn Fetcher>,
    emitters: Catalog<dyn Emitter>,
    sources: RwLock<HashMap<String, Arc<dyn SourceFactory>>>,
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fetcher_plugins: Vec<String> =
            self.fetchers.factories.read().keys().cloned().collect();
        let mut emitter_plugins: Vec<String> =
            self.emitters.factories.read().keys().cloned().collect();
        fetcher_plugins.sort();
        emitter_plugins.sort();

        f.debug_struct("ExtensionRegistry")
            .field("retry", &self.retry)
            .field("fetcher_plugins", &fetcher_plugins)
            .field("emitter_plugins", &emitter_plugins)
            .field("live_fetchers", &self.fetchers.live.read().len())
            .field("live_emitters", &self.emitters.live.read().len())
            .finish()
    }
}

impl ExtensionRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_retry(store, StoreRetryConfig::default())
    }

    pub fn with_retry(store: Arc<dyn StateStore>, retry: StoreRetryConfig) -> Self {
        Self {
            store,
            retry,
            fetchers: Catalog::new(Namespace::Fetcher, ExtensionKind::Fetcher),
            emitters: Catalog::new(Namespace::Emitter, ExtensionKind::Emitter),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Build the state store named by `descriptor` and a registry over it.
    pub async fn connect(
        descriptor: &ExtensionDescriptor,
        retry: StoreRetryConfig,
    ) -> Result<Self, PipesError> {
        let store = create_state_store(descriptor).await?;
        Ok(Self::with_retry(store, retry))
    }

    /// The state store descriptors are read from and written to.
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    pub fn retry_config(&self) -> &StoreRetryConfig {
        &self.retry
    }

    pub fn register_fetcher_factory(&self, factory: Arc<FetcherFactory>) {
        self.fetchers.register(factory);
    }

    pub fn register_emitter_factory(&self, factory: Arc<EmitterFactory>) {
        self.emitters.register(factory);
    }

    pub fn register_source_factory(&self, factory: Arc<dyn SourceFactory>) {
        let plugin_id = factory.plugin_id().to_string();
        self.sources.write().insert(plugin_id, factory);
    }

    /// Publish a fetcher descriptor under `fetcher:<id>`.
    pub async fn save_fetcher(
        &self,
        id: &str,
        descriptor: ExtensionDescriptor,
    ) -> Result<(), PipesError> {
        self.save(&self.fetchers, id, descriptor).await
    }

    /// Publish an emitter descriptor under `emitter:<id>`.
    pub async fn save_emitter(
        &self,
        id: &str,
        descriptor: ExtensionDescriptor,
    ) -> Result<(), PipesError> {
        self.save(&self.emitters, id, descriptor).await
    }

    /// Resolve the live fetcher registered under `id`.
    pub async fn fetcher(&self, id: &str) -> Result<Arc<dyn Fetcher>, PipesError> {
        self.resolve(&self.fetchers, id).await
    }

    /// Resolve the live emitter registered under `id`.
    pub async fn emitter(&self, id: &str) -> Result<Arc<dyn Emitter>, PipesError> {
        self.resolve(&self.emitters, id).await
    }

    pub async fn fetcher_descriptor(
        &self,
        id: &str,
    ) -> Result<Option<ExtensionDescriptor>, PipesError> {
        self.load_descriptor(&self.fetchers, id).await
    }

    pub async fn emitter_descriptor(
        &self,
        id: &str,
    ) -> Result<Option<ExtensionDescriptor>, PipesError> {
        self.load_descriptor(&self.emitters, id).await
    }

    /// Remove the fetcher registered under `id`. Returns whether it existed.
    pub async fn delete_fetcher(&self, id: &str) -> Result<bool, PipesError> {
        self.delete(&self.fetchers, id).await
    }

    /// Remove the emitter registered under `id`. Returns whether it existed.
    pub async fn delete_emitter(&self, id: &str) -> Result<bool, PipesError> {
        self.delete(&self.emitters, id).await
    }

    /// Ids of every registered fetcher, sorted.
    pub async fn list_fetchers(&self) -> Result<Vec<String>, PipesError> {
        self.list(&self.fetchers).await
    }

    /// Ids of every registered emitter, sorted.
    pub async fn list_emitters(&self) -> Result<Vec<String>, PipesError> {
        self.list(&self.emitters).await
    }

    /// Build a new source from a `source` descriptor.
    pub fn build_source(
        &self,
        descriptor: &ExtensionDescriptor,
    ) -> Result<Box<dyn PipesIterator>, PipesError> {
        if descriptor.kind != ExtensionKind::Source {
            return Err(PipesError::config(format!(
                "expected a source descriptor, got kind `{}`",
                descriptor.kind
            )));
        }
        let factory = self
            .sources
            .read()
            .get(&descriptor.plugin_id)
            .cloned()
            .ok_or_else(|| {
                PipesError::config(format!("unknown source plugin `{}`", descriptor.plugin_id))
            })?;
        factory
            .create(&descriptor.config_json)
            .map_err(|err| PipesError::config(format!("source could not be created: {err:#}")))
    }

    async fn save<T>(
        &self,
        catalog: &Catalog<T>,
        id: &str,
        descriptor: ExtensionDescriptor,
    ) -> Result<(), PipesError>
    where
        T: Extension + ?Sized,
    {
        if id.is_empty() {
            return Err(PipesError::config(format!("{} id must not be empty", catalog.kind)));
        }
        if descriptor.kind != catalog.kind {
            return Err(PipesError::config(format!(
                "cannot save a `{}` descriptor as {} `{id}`",
                descriptor.kind, catalog.kind
            )));
        }
        if !catalog.has_factory(&descriptor.plugin_id) {
            return Err(PipesError::config(format!(
                "{} `{id}` uses unknown plugin `{}`",
                catalog.kind, descriptor.plugin_id
            )));
        }

        let key = catalog.namespace.key(id);
        let bytes = serde_json::to_vec(&descriptor)?;
        let store = &self.store;
        with_retries(&self.retry, "put", &key, || store.put(&key, bytes.clone())).await?;
        catalog.invalidate(id);

        tracing::info!(kind = %catalog.kind, id, plugin_id = %descriptor.plugin_id, "saved extension");
        Ok(())
    }

    async fn load_descriptor<T>(
        &self,
        catalog: &Catalog<T>,
        id: &str,
    ) -> Result<Option<ExtensionDescriptor>, PipesError>
    where
        T: Extension + ?Sized,
    {
        let key = catalog.namespace.key(id);
        let store = &self.store;
        let Some(bytes) = with_retries(&self.retry, "get", &key, || store.get(&key)).await? else {
            return Ok(None);
        };
        let descriptor: ExtensionDescriptor = serde_json::from_slice(&bytes).map_err(|err| {
            PipesError::config(format!("stored descriptor for {} `{id}` is invalid: {err}", catalog.kind))
        })?;
        Ok(Some(descriptor))
    }

    async fn resolve<T>(&self, catalog: &Catalog<T>, id: &str) -> Result<Arc<T>, PipesError>
    where
        T: Extension + ?Sized,
    {
        let Some(descriptor) = self.load_descriptor(catalog, id).await? else {
            catalog.invalidate(id);
            return Err(PipesError::config(format!(
                "no {} registered under `{id}`",
                catalog.kind
            )));
        };

        let instance = match catalog.cached(id, &descriptor) {
            Some(instance) => instance,
            None => catalog.materialize(id, descriptor).await?,
        };

        let key = catalog.namespace.key(id);
        if let Err(err) = self.store.update_access_time(&key, Utc::now()).await {
            tracing::debug!(key = %key, "failed to touch access time: {err:#}");
        }
        Ok(instance)
    }

    async fn delete<T>(&self, catalog: &Catalog<T>, id: &str) -> Result<bool, PipesError>
    where
        T: Extension + ?Sized,
    {
        let key = catalog.namespace.key(id);
        let store = &self.store;
        let existed = with_retries(&self.retry, "delete", &key, || store.delete(&key)).await?;
        catalog.invalidate(id);
        if existed {
            tracing::info!(kind = %catalog.kind, id, "deleted extension");
        }
        Ok(existed)
    }

    async fn list<T>(&self, catalog: &Catalog<T>) -> Result<Vec<String>, PipesError>
    where
        T: Extension + ?Sized,
    {
        let store = &self.store;
        let keys = with_retries(&self.retry, "list_keys", catalog.namespace.as_str(), || {
            store.list_keys()
        })
        .await?;
        Ok(keys
            .iter()
            .filter_map(|key| catalog.namespace.strip(key))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullFetcher {
        available: bool,
    }

    #[async_trait]
    impl Extension for NullFetcher {
        async fn is_available(&self) -> bool {
            self.available
        }
    }

    #[async_trait]
    impl Fetcher for NullFetcher {
        async fn fetch(&self, _fetch_key: &str, _metadata: &Metadata) -> anyhow::Result<ByteStream> {
            Ok(Box::pin(std::io::Cursor::new(Vec::new())))
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl ExtensionFactory<dyn Fetcher> for CountingFactory {
        fn plugin_id(&self) -> &str {
            "null"
        }

        fn create(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Fetcher>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let available = config
                .get("available")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true);
            Ok(Arc::new(NullFetcher { available }))
        }
    }

    fn registry() -> (ExtensionRegistry, Arc<CountingFactory>) {
        let registry = ExtensionRegistry::new(Arc::new(LocalStateStore::new()));
        let factory = Arc::new(CountingFactory::default());
        registry.register_fetcher_factory(factory.clone());
        (registry, factory)
    }

    #[test]
    fn descriptor_kind_serializes_lowercase() {
        let descriptor =
            ExtensionDescriptor::new("local", ExtensionKind::StateStore, serde_json::Value::Null);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["kind"], "statestore");
    }

    #[tokio::test]
    async fn resolved_instance_is_shared_until_descriptor_changes() {
        let (registry, factory) = registry();
        registry
            .save_fetcher("fs", ExtensionDescriptor::fetcher("null", serde_json::json!({})))
            .await
            .unwrap();

        let a = registry.fetcher("fs").await.unwrap();
        let b = registry.fetcher("fs").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        registry
            .save_fetcher(
                "fs",
                ExtensionDescriptor::fetcher("null", serde_json::json!({"root": "/data"})),
            )
            .await
            .unwrap();
        let c = registry.fetcher("fs").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolution_touches_access_time() {
        let (registry, _) = registry();
        registry
            .save_fetcher("fs", ExtensionDescriptor::fetcher("null", serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(registry.store().get_access_time("fetcher:fs").await.unwrap(), None);

        registry.fetcher("fs").await.unwrap();
        assert!(registry
            .store()
            .get_access_time("fetcher:fs")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn unknown_missing_or_unavailable_extensions_are_config_errors() {
        let (registry, _) = registry();

        assert!(matches!(registry.fetcher("nope").await, Err(PipesError::Config(_))));

        let err = registry
            .save_fetcher("s3", ExtensionDescriptor::fetcher("s3", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, PipesError::Config(_)));

        registry
            .save_fetcher(
                "gpu",
                ExtensionDescriptor::fetcher("null", serde_json::json!({"available": false})),
            )
            .await
            .unwrap();
        assert!(matches!(registry.fetcher("gpu").await, Err(PipesError::Config(_))));
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected_on_save() {
        let (registry, _) = registry();
        let err = registry
            .save_emitter("out", ExtensionDescriptor::fetcher("null", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, PipesError::Config(_)));
    }

    #[tokio::test]
    async fn list_and_delete_follow_the_store() {
        let (registry, _) = registry();
        for id in ["b", "a"] {
            registry
                .save_fetcher(id, ExtensionDescriptor::fetcher("null", serde_json::Value::Null))
                .await
                .unwrap();
        }
        assert_eq!(registry.list_fetchers().await.unwrap(), vec!["a", "b"]);
        assert!(registry.list_emitters().await.unwrap().is_empty());

        assert!(registry.delete_fetcher("a").await.unwrap());
        assert!(!registry.delete_fetcher("a").await.unwrap());
        assert_eq!(registry.list_fetchers().await.unwrap(), vec!["b"]);
        assert!(registry.fetcher_descriptor("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registrations_are_visible_through_a_shared_store() {
        let store = Arc::new(LocalStateStore::new());
        let node_a = ExtensionRegistry::new(store.clone());
        let node_b = ExtensionRegistry::new(store);
        node_a.register_fetcher_factory(Arc::new(CountingFactory::default()));
        node_b.register_fetcher_factory(Arc::new(CountingFactory::default()));

        node_a
            .save_fetcher("shared", ExtensionDescriptor::fetcher("null", serde_json::Value::Null))
            .await
            .unwrap();
        assert!(node_b.fetcher("shared").await.is_ok());
    }

    struct ListSourceFactory;

    impl SourceFactory for ListSourceFactory {
        fn plugin_id(&self) -> &str {
            "list"
        }

        fn create(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PipesIterator>> {
            let ids: Vec<String> = serde_json::from_value(config["ids"].clone())?;
            Ok(Box::new(
                ids.iter()
                    .map(|id| {
                        crate::item::WorkItem::new(
                            id.as_str(),
                            crate::item::FetchKey::new("fs", id.as_str()),
                            crate::item::EmitKey::new("out", id.as_str()),
                        )
                    })
                    .collect::<crate::source::VecSource>(),
            ))
        }
    }

    #[tokio::test]
    async fn sources_are_built_fresh_from_descriptors() {
        let (registry, _) = registry();
        registry.register_source_factory(Arc::new(ListSourceFactory));

        let descriptor = ExtensionDescriptor::source("list", serde_json::json!({"ids": ["a", "b"]}));
        let mut source = registry.build_source(&descriptor).unwrap();
        source.open().await.unwrap();
        assert_eq!(source.next().await.unwrap().unwrap().id.as_str(), "a");
        assert_eq!(source.total_count().await, Some(2));

        let unknown = ExtensionDescriptor::source("nope", serde_json::Value::Null);
        assert!(matches!(registry.build_source(&unknown), Err(PipesError::Config(_))));
        let wrong_kind = ExtensionDescriptor::fetcher("list", serde_json::Value::Null);
        assert!(matches!(registry.build_source(&wrong_kind), Err(PipesError::Config(_))));
    }
}
