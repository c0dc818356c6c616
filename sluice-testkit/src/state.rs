use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sluice::{LocalStateStore, StateStore};

/// Local store that can be told to start failing reads, simulating a shared
/// backend going away mid-job.
#[derive(Clone, Debug, Default)]
pub struct OutageStore {
    inner: LocalStateStore,
    failing_prefix: Arc<Mutex<Option<String>>>,
    failed_reads: Arc<Mutex<u64>>,
}

impl OutageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `get` whose key starts with `prefix` until [`restore`](Self::restore).
    pub fn fail_reads(&self, prefix: impl Into<String>) {
        *self.failing_prefix.lock() = Some(prefix.into());
    }

    pub fn restore(&self) {
        *self.failing_prefix.lock() = None;
    }

    pub fn failed_reads(&self) -> u64 {
        *self.failed_reads.lock()
    }

    fn check(&self, key: &str) -> anyhow::Result<()> {
        let failing = self
            .failing_prefix
            .lock()
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix));
        if failing {
            *self.failed_reads.lock() += 1;
            anyhow::bail!("state store unreachable reading `{key}`");
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for OutageStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.check(key)?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.delete(key).await
    }

    async fn list_keys(&self) -> anyhow::Result<BTreeSet<String>> {
        self.inner.list_keys().await
    }

    async fn update_access_time(&self, key: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.inner.update_access_time(key, at).await
    }

    async fn get_access_time(&self, key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.inner.get_access_time(key).await
    }
}
