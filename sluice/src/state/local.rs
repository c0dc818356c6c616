use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::StateStore;

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    last_access: Option<DateTime<Utc>>,
}

/// In-process state store backed by a hash map.
///
/// Clones share the same map, so handing one clone to several supervisors in
/// the same process gives them a common view.
#[derive(Clone, Default)]
pub struct LocalStateStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl std::fmt::Debug for LocalStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("LocalStateStore");
        match self.entries.try_read() {
            Some(entries) => debug.field("len", &entries.len()),
            None => debug.field("len", &"<locked>"),
        };
        debug.finish()
    }
}

impl LocalStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        // A fresh write starts a new idle period.
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value,
                last_access: None,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn list_keys(&self) -> anyhow::Result<BTreeSet<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn contains_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn update_access_time(&self, key: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.last_access = Some(entry.last_access.map_or(at, |previous| previous.max(at)));
        }
        Ok(())
    }

    async fn get_access_time(&self, key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self
            .entries
            .read()
            .get(key)
            .and_then(|entry| entry.last_access))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_identical_bytes() {
        let store = LocalStateStore::new();
        let value = vec![0u8, 159, 146, 150, 255];
        store.put("fetcher:fs", value.clone()).await.unwrap();
        assert_eq!(store.get("fetcher:fs").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let store = LocalStateStore::new();
        store.put("job:1", b"a".to_vec()).await.unwrap();

        assert!(store.delete("job:1").await.unwrap());
        assert!(!store.delete("job:1").await.unwrap());
        assert_eq!(store.get("job:1").await.unwrap(), None);
        assert!(!store.contains_key("job:1").await.unwrap());
    }

    #[tokio::test]
    async fn list_keys_tracks_puts_and_deletes() {
        let store = LocalStateStore::new();
        store.put("fetcher:a", vec![1]).await.unwrap();
        store.put("emitter:b", vec![2]).await.unwrap();
        store.put("fetcher:a", vec![3]).await.unwrap();
        store.delete("emitter:b").await.unwrap();

        let keys: Vec<String> = store.list_keys().await.unwrap().into_iter().collect();
        assert_eq!(keys, vec!["fetcher:a".to_string()]);
    }

    #[tokio::test]
    async fn overwrite_resets_access_time_and_missing_keys_are_ignored() {
        let store = LocalStateStore::new();
        let at = Utc::now();

        store.update_access_time("missing", at).await.unwrap();
        assert_eq!(store.get_access_time("missing").await.unwrap(), None);

        store.put("fetcher:a", vec![1]).await.unwrap();
        store.update_access_time("fetcher:a", at).await.unwrap();
        assert_eq!(store.get_access_time("fetcher:a").await.unwrap(), Some(at));

        store.put("fetcher:a", vec![2]).await.unwrap();
        assert_eq!(store.get_access_time("fetcher:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn access_time_never_moves_backwards() {
        let store = LocalStateStore::new();
        let later = Utc::now();
        store.put("emitter:out", vec![1]).await.unwrap();

        store.update_access_time("emitter:out", later).await.unwrap();
        store
            .update_access_time("emitter:out", later - chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(store.get_access_time("emitter:out").await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let a = LocalStateStore::new();
        let b = a.clone();
        a.put("job:x", vec![9]).await.unwrap();
        assert_eq!(b.get("job:x").await.unwrap(), Some(vec![9]));
        assert_eq!(b.len(), 1);
    }
}
