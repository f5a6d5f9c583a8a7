use std::collections::BTreeMap;
use std::collections::HashMap;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use tracing::warn;

use weft_protocol::ChunkEncoding;
use weft_protocol::ChunkTarget;

/// Fragments of one chunked payload, keyed by chunk sequence number.
#[derive(Debug, Default)]
struct ChunkAccumulator {
    encoding: Option<ChunkEncoding>,
    format: Option<String>,
    fragments: BTreeMap<u32, String>,
}

/// A payload reassembled by [`ChunkStore::take`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledChunk {
    pub data: String,
    pub encoding: ChunkEncoding,
    /// Format string declared by the stream (e.g. `"png"`), if any.
    pub format: Option<String>,
}

/// Reassembles payloads split across `chunk_delta` events.
///
/// Buffers are keyed by the full `(entity, entity_id, field, part_index)`
/// target so unrelated payloads can interleave freely; each buffer is
/// consumed exactly once by the terminal `chunk_done` event for its target.
#[derive(Debug, Default)]
pub struct ChunkStore {
    buffers: HashMap<ChunkTarget, ChunkAccumulator>,
}

impl ChunkStore {
    /// Record one fragment at its sequence number. The first declared
    /// encoding and format win; later deltas may omit both.
    pub fn apply_delta(
        &mut self,
        target: &ChunkTarget,
        chunk_index: u32,
        data: &str,
        encoding: Option<ChunkEncoding>,
        format: Option<&str>,
    ) {
        let acc = self.buffers.entry(target.clone()).or_default();
        if acc.encoding.is_none() {
            acc.encoding = encoding;
        }
        if acc.format.is_none() {
            acc.format = format.map(str::to_string);
        }
        if acc.fragments.insert(chunk_index, data.to_string()).is_some() {
            warn!(?target, chunk_index, "duplicate chunk fragment replaced");
        }
    }

    /// Consume the buffer for `target`: concatenate its fragments in
    /// ascending sequence order and drop the accumulator. Returns `None`
    /// when no fragment ever arrived for the target.
    pub fn take(&mut self, target: &ChunkTarget) -> Option<AssembledChunk> {
        let acc = self.buffers.remove(target)?;
        let mut data = String::new();
        for fragment in acc.fragments.values() {
            data.push_str(fragment);
        }
        Some(AssembledChunk {
            data,
            encoding: acc.encoding.unwrap_or(ChunkEncoding::Base64),
            format: acc.format,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl AssembledChunk {
    /// Wrap the payload as a `data:` URI. The MIME type comes from the
    /// declared format, falling back to `default_format` (PNG by default at
    /// the engine level) when the stream never declared one.
    pub fn into_data_uri(self, default_format: &str) -> String {
        let ext = self.format.as_deref().unwrap_or(default_format);
        let mime = mime_guess::from_ext(ext)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "image/png".to_string());
        let payload = match self.encoding {
            ChunkEncoding::Base64 => self.data,
            ChunkEncoding::Utf8 => BASE64_STANDARD.encode(self.data.as_bytes()),
        };
        format!("data:{mime};base64,{payload}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use weft_protocol::ChunkEntity;

    fn target(entity_id: &str, part_index: u32) -> ChunkTarget {
        ChunkTarget {
            entity: ChunkEntity::ToolCall,
            entity_id: entity_id.to_string(),
            field: "image".to_string(),
            part_index,
        }
    }

    #[test]
    fn reassembly_is_independent_of_arrival_order() {
        let t = target("call_1", 0);
        let orders: &[&[(u32, &str)]] = &[
            &[(0, "AA"), (1, "BB"), (2, "CC")],
            &[(2, "CC"), (0, "AA"), (1, "BB")],
            &[(1, "BB"), (2, "CC"), (0, "AA")],
        ];
        for order in orders {
            let mut store = ChunkStore::default();
            for (index, data) in *order {
                store.apply_delta(&t, *index, data, Some(ChunkEncoding::Base64), None);
            }
            let chunk = store.take(&t).expect("assembled");
            assert_eq!(chunk.data, "AABBCC");
        }
    }

    #[test]
    fn take_is_one_shot() {
        let t = target("call_1", 0);
        let mut store = ChunkStore::default();
        store.apply_delta(&t, 0, "AA", Some(ChunkEncoding::Base64), None);
        assert!(store.take(&t).is_some());
        assert!(store.take(&t).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn unrelated_targets_interleave_without_crosstalk() {
        let a = target("call_1", 0);
        let b = target("call_1", 1);
        let c = target("call_2", 0);
        let mut store = ChunkStore::default();
        store.apply_delta(&a, 0, "a0", Some(ChunkEncoding::Utf8), None);
        store.apply_delta(&c, 1, "c1", Some(ChunkEncoding::Utf8), None);
        store.apply_delta(&b, 0, "b0", Some(ChunkEncoding::Utf8), None);
        store.apply_delta(&c, 0, "c0", None, None);
        store.apply_delta(&a, 1, "a1", None, None);
        assert_eq!(store.take(&a).expect("a").data, "a0a1");
        assert_eq!(store.take(&b).expect("b").data, "b0");
        assert_eq!(store.take(&c).expect("c").data, "c0c1");
    }

    #[test]
    fn first_declared_encoding_wins() {
        let t = target("call_1", 0);
        let mut store = ChunkStore::default();
        store.apply_delta(&t, 0, "hi ", Some(ChunkEncoding::Utf8), None);
        store.apply_delta(&t, 1, "there", Some(ChunkEncoding::Base64), None);
        let chunk = store.take(&t).expect("assembled");
        assert_eq!(chunk.encoding, ChunkEncoding::Utf8);
    }

    #[test]
    fn data_uri_defaults_to_png() {
        let chunk = AssembledChunk {
            data: "aGk=".to_string(),
            encoding: ChunkEncoding::Base64,
            format: None,
        };
        assert_eq!(chunk.into_data_uri("png"), "data:image/png;base64,aGk=");
    }

    #[test]
    fn utf8_payloads_are_encoded_for_the_uri() {
        let chunk = AssembledChunk {
            data: "hi".to_string(),
            encoding: ChunkEncoding::Utf8,
            format: Some("webp".to_string()),
        };
        assert_eq!(chunk.into_data_uri("png"), "data:image/webp;base64,aGk=");
    }
}
