use sluice::*;

use crate::{MOCK_EMITTER_ID, MOCK_FETCHER_ID};

/// An item whose fetched content is `content` and whose results are emitted
/// under its own id.
pub fn work_item(id: &str, content: &str) -> WorkItem {
    WorkItem::new(
        id,
        FetchKey::new(MOCK_FETCHER_ID, content),
        EmitKey::new(MOCK_EMITTER_ID, id),
    )
}

/// `count` well-behaved items named `item-0`, `item-1`, ...
pub fn work_items(count: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|i| work_item(&format!("item-{i}"), &format!("document {i}")))
        .collect()
}

/// A source over `items`.
pub fn source_of(items: Vec<WorkItem>) -> VecSource {
    VecSource::new(items)
}
