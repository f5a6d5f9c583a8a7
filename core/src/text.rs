use std::collections::BTreeMap;
use std::collections::HashMap;

/// Positional text fragments for the items of one channel.
///
/// Each item id owns a set of content slots; a slot may be appended to or
/// overwritten wholesale, never reordered. The assembled text of an item is
/// the concatenation of its fragments in ascending slot order, so the same
/// text arrives identically no matter how the server split the deltas.
#[derive(Debug, Default)]
pub struct TextPartsStore {
    items: HashMap<String, BTreeMap<u32, String>>,
}

impl TextPartsStore {
    /// Merge `delta` onto the fragment at `slot` (creating it if absent) and
    /// return the full assembled string for the item.
    pub fn append_delta(&mut self, item_id: &str, slot: u32, delta: &str) -> String {
        let slots = self.items.entry(item_id.to_string()).or_default();
        slots.entry(slot).or_default().push_str(delta);
        concat(slots)
    }

    /// Overwrite `slot` wholesale and return the assembled string.
    ///
    /// Only terminal "done" variants of an event family use this; they carry
    /// authoritative snapshots, not deltas.
    pub fn replace(&mut self, item_id: &str, slot: u32, text: &str) -> String {
        let slots = self.items.entry(item_id.to_string()).or_default();
        slots.insert(slot, text.to_string());
        concat(slots)
    }

    pub fn assembled(&self, item_id: &str) -> String {
        self.items.get(item_id).map(concat).unwrap_or_default()
    }

    /// True when no item has produced any text.
    pub fn is_empty(&self) -> bool {
        self.items
            .values()
            .all(|slots| slots.values().all(|fragment| fragment.is_empty()))
    }
}

fn concat(slots: &BTreeMap<u32, String>) -> String {
    let mut out = String::new();
    for fragment in slots.values() {
        out.push_str(fragment);
    }
    out
}
