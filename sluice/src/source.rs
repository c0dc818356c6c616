use std::collections::VecDeque;

use async_trait::async_trait;

use crate::item::WorkItem;

/// Lazy, finite sequence of work items for one job.
///
/// `open` is called once before the first `next`. Any error from `open` aborts
/// the job before dispatch; an error from `next` stops intake and fails the job.
#[async_trait]
pub trait PipesIterator: Send + Sync {
    async fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produce the next item, or `None` once the listing is exhausted.
    async fn next(&mut self) -> anyhow::Result<Option<WorkItem>>;

    /// Whether `open` may be called again to replay the listing.
    fn is_restartable(&self) -> bool {
        false
    }

    /// Cheap estimate of how many items the listing holds, if known.
    async fn total_count(&self) -> Option<u64> {
        None
    }
}

/// Source over a pre-built list of items.
#[derive(Clone, Debug, Default)]
pub struct VecSource {
    items: Vec<WorkItem>,
    pending: VecDeque<WorkItem>,
}

impl VecSource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            pending: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<WorkItem> for VecSource {
    fn from_iter<I: IntoIterator<Item = WorkItem>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[async_trait]
impl PipesIterator for VecSource {
    async fn open(&mut self) -> anyhow::Result<()> {
        self.pending = self.items.iter().cloned().collect();
        Ok(())
    }

    async fn next(&mut self) -> anyhow::Result<Option<WorkItem>> {
        Ok(self.pending.pop_front())
    }

    fn is_restartable(&self) -> bool {
        true
    }

    async fn total_count(&self) -> Option<u64> {
        Some(self.items.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{EmitKey, FetchKey};

    fn item(id: &str) -> WorkItem {
        WorkItem::new(id, FetchKey::new("fs", id), EmitKey::new("out", id))
    }

    #[tokio::test]
    async fn vec_source_replays_after_reopen() {
        let mut source: VecSource = ["a", "b"].into_iter().map(item).collect();
        assert!(source.is_restartable());
        assert_eq!(source.total_count().await, Some(2));

        source.open().await.unwrap();
        assert_eq!(source.next().await.unwrap().unwrap().id.as_str(), "a");
        assert_eq!(source.next().await.unwrap().unwrap().id.as_str(), "b");
        assert!(source.next().await.unwrap().is_none());

        source.open().await.unwrap();
        assert_eq!(source.next().await.unwrap().unwrap().id.as_str(), "a");
    }

    #[tokio::test]
    async fn unopened_source_yields_nothing() {
        let mut source = VecSource::new(vec![item("a")]);
        assert!(source.next().await.unwrap().is_none());
    }
}
