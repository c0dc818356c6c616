//! Namespaced key/value state shared between orchestrator nodes.
//!
//! The orchestrator only ever talks to the [`StateStore`] trait. Which backend
//! is active is decided once, at startup, by [`create_state_store`] from an
//! [`ExtensionDescriptor`] of kind `statestore`.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipesError;
use crate::extension::{ExtensionDescriptor, ExtensionKind};
use crate::runtime::ShutdownToken;

/// In-process map backend.
pub mod local;

#[cfg(feature = "postgres")]
/// PostgreSQL backend shared by every node pointing at the same database.
pub mod postgres;

pub use local::LocalStateStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStateStore;

/// Key partitions used by the orchestrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Fetcher,
    Emitter,
    Job,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Fetcher => "fetcher",
            Namespace::Emitter => "emitter",
            Namespace::Job => "job",
        }
    }

    /// Build the full `namespace:name` key.
    pub fn key(&self, name: impl Display) -> String {
        format!("{}:{}", self.as_str(), name)
    }

    /// Strip this namespace's prefix from a full key.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }
}

/// Namespaced key/value store.
///
/// Every backend must satisfy the same contract: put-then-get on the same
/// backend returns identical bytes, delete-then-get returns `None`, and there
/// are no multi-key transactions. Visibility across nodes is eventual.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the backend. Called once before first use.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Remove `key`. Returns whether a value was present.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// All keys currently stored.
    async fn list_keys(&self) -> anyhow::Result<BTreeSet<String>>;

    async fn contains_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Record that `key` was used at `at`. Advisory only.
    async fn update_access_time(&self, key: &str, at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn get_access_time(&self, key: &str) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Release backend resources.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Plugin id of the in-process backend.
pub const LOCAL_PLUGIN_ID: &str = "local";
/// Plugin id of the PostgreSQL backend.
pub const POSTGRES_PLUGIN_ID: &str = "postgres";

/// Build and initialize the state store named by `descriptor`.
///
/// `descriptor.kind` must be [`ExtensionKind::StateStore`]; `plugin_id`
/// selects the backend.
pub async fn create_state_store(
    descriptor: &ExtensionDescriptor,
) -> Result<Arc<dyn StateStore>, PipesError> {
    if descriptor.kind != ExtensionKind::StateStore {
        return Err(PipesError::config(format!(
            "expected a statestore descriptor, got kind `{}`",
            descriptor.kind
        )));
    }

    let store: Arc<dyn StateStore> = match descriptor.plugin_id.as_str() {
        LOCAL_PLUGIN_ID => Arc::new(LocalStateStore::new()),
        #[cfg(feature = "postgres")]
        POSTGRES_PLUGIN_ID => {
            let config: postgres::PostgresStateStoreConfig =
                serde_json::from_value(descriptor.config_json.clone()).map_err(|err| {
                    PipesError::config(format!("invalid postgres state store config: {err}"))
                })?;
            Arc::new(
                PostgresStateStore::connect(&config)
                    .await
                    .map_err(|err| PipesError::config(format!("{err:#}")))?,
            )
        }
        other => {
            return Err(PipesError::config(format!(
                "unknown state store backend `{other}`"
            )))
        }
    };

    store
        .initialize()
        .await
        .map_err(|err| PipesError::config(format!("state store initialization failed: {err:#}")))?;

    tracing::info!(backend = %descriptor.plugin_id, "state store initialized");
    Ok(store)
}

/// Spawn a sweeper that deletes extension registrations whose access time is
/// older than `max_idle`.
///
/// Only the `fetcher:` and `emitter:` namespaces are swept. Keys with no
/// recorded access time are left alone.
pub fn spawn_expiry_sweeper(
    store: Arc<dyn StateStore>,
    max_idle: Duration,
    interval: Duration,
    shutdown: ShutdownToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("state store sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    match sweep_expired(store.as_ref(), max_idle, Utc::now()).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "expired stale registrations"),
                        Err(err) => tracing::warn!("state store sweep error: {err:#}"),
                    }
                }
            }
        }
    })
}

/// Delete stale extension registrations once. Returns how many were removed.
pub async fn sweep_expired(
    store: &dyn StateStore,
    max_idle: Duration,
    now: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let max_idle = chrono::Duration::from_std(max_idle)?;
    let mut removed = 0;

    for key in store.list_keys().await? {
        let sweepable = Namespace::Fetcher.strip(&key).is_some()
            || Namespace::Emitter.strip(&key).is_some();
        if !sweepable {
            continue;
        }
        let Some(last_access) = store.get_access_time(&key).await? else {
            continue;
        };
        if now - last_access > max_idle && store.delete(&key).await? {
            tracing::debug!(key = %key, %last_access, "removing stale registration");
            removed += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_keys_round_trip() {
        let key = Namespace::Fetcher.key("fs-main");
        assert_eq!(key, "fetcher:fs-main");
        assert_eq!(Namespace::Fetcher.strip(&key), Some("fs-main"));
        assert_eq!(Namespace::Emitter.strip(&key), None);
        assert_eq!(Namespace::Fetcher.strip("fetchers:x"), None);
    }

    #[tokio::test]
    async fn factory_builds_local_backend() {
        let descriptor = ExtensionDescriptor::new(
            LOCAL_PLUGIN_ID,
            ExtensionKind::StateStore,
            serde_json::Value::Null,
        );
        let store = create_state_store(&descriptor).await.unwrap();
        store.put("job:1", b"x".to_vec()).await.unwrap();
        assert!(store.contains_key("job:1").await.unwrap());
    }

    #[tokio::test]
    async fn factory_rejects_unknown_backend_and_wrong_kind() {
        let unknown = ExtensionDescriptor::new(
            "memcached",
            ExtensionKind::StateStore,
            serde_json::Value::Null,
        );
        assert!(matches!(
            create_state_store(&unknown).await,
            Err(PipesError::Config(_))
        ));

        let wrong_kind = ExtensionDescriptor::new(
            LOCAL_PLUGIN_ID,
            ExtensionKind::Fetcher,
            serde_json::Value::Null,
        );
        assert!(matches!(
            create_state_store(&wrong_kind).await,
            Err(PipesError::Config(_))
        ));
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_registrations() {
        let store = LocalStateStore::new();
        let now = Utc::now();
        let stale = now - chrono::Duration::minutes(30);

        for key in ["fetcher:old", "emitter:fresh", "job:old", "fetcher:untouched"] {
            store.put(key, b"{}".to_vec()).await.unwrap();
        }
        store.update_access_time("fetcher:old", stale).await.unwrap();
        store.update_access_time("job:old", stale).await.unwrap();
        store.update_access_time("emitter:fresh", now).await.unwrap();

        // Re-saved after a long idle period: the write starts a new idle period.
        store.put("fetcher:resaved", b"{}".to_vec()).await.unwrap();
        store
            .update_access_time("fetcher:resaved", now - chrono::Duration::hours(2))
            .await
            .unwrap();
        store.put("fetcher:resaved", b"{\"v\":2}".to_vec()).await.unwrap();

        let removed = sweep_expired(&store, Duration::from_secs(600), now)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let keys = store.list_keys().await.unwrap();
        assert!(!keys.contains("fetcher:old"));
        assert!(keys.contains("emitter:fresh"));
        assert!(keys.contains("job:old"));
        assert!(keys.contains("fetcher:untouched"));
        assert!(keys.contains("fetcher:resaved"));
    }
}
