use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::message::ChatMessage;
use crate::message::MessageKind;
use crate::message::is_optimistic_id;
use crate::message::optimistic_id_millis;

/// Identity used to pair an optimistic message with its persisted
/// counterpart.
pub(crate) type MessageSignature = (MessageKind, String, String);

pub(crate) fn signature(message: &ChatMessage, config: &EngineConfig) -> MessageSignature {
    (
        message.kind,
        message.role.clone(),
        normalize_content(&message.content, &config.cursor_marker),
    )
}

/// Strip a trailing in-progress cursor marker and surrounding whitespace so
/// a streaming snapshot compares equal to its settled form.
pub(crate) fn normalize_content(content: &str, cursor_marker: &str) -> String {
    let trimmed = content.trim();
    let trimmed = trimmed.strip_suffix(cursor_marker).unwrap_or(trimmed);
    trimmed.trim().to_string()
}

#[derive(Debug, Clone)]
struct Entry {
    message: ChatMessage,
    index: usize,
    ts: Option<DateTime<Utc>>,
}

impl Entry {
    /// Millisecond sort key: the message timestamp, else the creation time
    /// embedded in an optimistic id. Entries with neither sort by original
    /// index at the tail.
    fn sort_millis(&self) -> i64 {
        self.ts
            .map(|ts| ts.timestamp_millis())
            .or_else(|| optimistic_id_millis(&self.message.id))
            .unwrap_or(i64::MAX)
    }
}

/// Reconcile optimistic (client-predicted) messages with persisted
/// (server-confirmed) messages.
///
/// Messages group by `(kind, role, normalized content)`. Within a group the
/// optimistic and persisted runs are each timestamp-sorted and merged by a
/// greedy two-pointer walk: a pair merges when both timestamps parse and lie
/// within the dedup window, or when either side lacks a parseable timestamp;
/// otherwise the earlier side advances alone, which keeps legitimately
/// repeated identical sends apart. Exactly one of each merged pair survives,
/// carrying the persisted identity.
pub fn merge_messages(messages: Vec<ChatMessage>, config: &EngineConfig) -> Vec<ChatMessage> {
    let mut groups: IndexMap<MessageSignature, Vec<Entry>> = IndexMap::new();
    for (index, message) in messages.into_iter().enumerate() {
        let ts = message.parsed_timestamp();
        groups
            .entry(signature(&message, config))
            .or_default()
            .push(Entry { message, index, ts });
    }

    let mut merged: Vec<Entry> = Vec::new();
    for (_, group) in groups {
        let (mut optimistic, mut persisted): (Vec<Entry>, Vec<Entry>) = group
            .into_iter()
            .partition(|entry| is_optimistic_id(&entry.message.id));
        optimistic.sort_by_key(|entry| (entry.ts, entry.index));
        persisted.sort_by_key(|entry| (entry.ts, entry.index));
        merged.extend(merge_group(optimistic, persisted, config));
    }

    merged.sort_by_key(|entry| (entry.sort_millis(), entry.index));
    merged.into_iter().map(|entry| entry.message).collect()
}

fn merge_group(optimistic: Vec<Entry>, persisted: Vec<Entry>, config: &EngineConfig) -> Vec<Entry> {
    let mut optimistic: VecDeque<Entry> = optimistic.into();
    let mut persisted: VecDeque<Entry> = persisted.into();
    let mut out = Vec::new();
    while let (Some(a), Some(b)) = (optimistic.front(), persisted.front()) {
        let mergeable = match (a.ts, b.ts) {
            (Some(x), Some(y)) => (x - y).abs() <= config.dedup_window,
            _ => true,
        };
        if mergeable {
            if let (Some(a), Some(b)) = (optimistic.pop_front(), persisted.pop_front()) {
                debug!(
                    optimistic_id = %a.message.id,
                    persisted_id = %b.message.id,
                    "merged optimistic message into persisted counterpart"
                );
                out.push(merge_pair(a, b));
            }
        } else if a.ts <= b.ts {
            if let Some(a) = optimistic.pop_front() {
                out.push(a);
            }
        } else if let Some(b) = persisted.pop_front() {
            out.push(b);
        }
    }
    out.extend(optimistic);
    out.extend(persisted);
    out
}

/// The persisted side keeps its identity, content and timestamp; fields it
/// left empty are backfilled from the optimistic side.
fn merge_pair(optimistic: Entry, persisted: Entry) -> Entry {
    let mut message = persisted.message;
    if message.citations.is_empty() {
        message.citations = optimistic.message.citations;
    }
    if message.structured_output.is_none() {
        message.structured_output = optimistic.message.structured_output;
    }
    if message.attachments.is_empty() {
        message.attachments = optimistic.message.attachments;
    }
    Entry {
        message,
        index: persisted.index.min(optimistic.index),
        ts: persisted.ts.or(optimistic.ts),
    }
}
