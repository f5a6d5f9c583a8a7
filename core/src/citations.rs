use indexmap::IndexMap;

use weft_protocol::Citation;

/// Append-only citation lists keyed by source item id.
///
/// Consulted only at turn-final resolution: the last-active item's citations
/// are preferred, with the union of everything collected as the fallback.
#[derive(Debug, Default)]
pub struct CitationAccumulator {
    by_item: IndexMap<String, Vec<Citation>>,
}

impl CitationAccumulator {
    pub fn push(&mut self, item_id: &str, citation: Citation) {
        self.by_item
            .entry(item_id.to_string())
            .or_default()
            .push(citation);
    }

    pub fn for_item(&self, item_id: &str) -> &[Citation] {
        self.by_item.get(item_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All citations across items, in collection order.
    pub fn union(&self) -> Vec<Citation> {
        self.by_item.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_item.values().all(Vec::is_empty)
    }
}
