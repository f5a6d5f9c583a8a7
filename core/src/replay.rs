use std::collections::HashMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use tracing::debug;

use weft_protocol::EventPayload;
use weft_protocol::MemoryCheckpoint;
use weft_protocol::StreamEvent;

use crate::config::EngineConfig;
use crate::chunks::ChunkStore;
use crate::merge::signature;
use crate::message::ChatMessage;
use crate::message::MessageKind;
use crate::tools::ToolCallState;
use crate::tools::ToolTracker;
use crate::tools::deliver_chunk;

/// A `{tools, anchors}` pair: the reconstructed tool set and, for each
/// message id, the ordered tool call ids anchored to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolTimeline {
    pub tools: Vec<ToolCallState>,
    pub anchors: ToolAnchors,
}

/// Message id → ordered tool call ids considered to have started during or
/// after that message.
pub type ToolAnchors = IndexMap<String, Vec<String>>;

/// Output of one ledger replay: the tool timeline plus the synthetic
/// checkpoint markers found along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerReplay {
    pub timeline: ToolTimeline,
    pub checkpoints: Vec<ChatMessage>,
}

/// Reconstruct the tool timeline from a persisted, complete event list.
///
/// Runs the same tool lifecycle logic as the live path, deterministically
/// and without callbacks, while recording each tool's first-seen wall-clock
/// timestamp. Each tool is then anchored to the nearest preceding message;
/// a tool first seen before the earliest loaded message (pagination cut) is
/// dropped, not mis-anchored. Replaying the same list twice produces
/// identical output.
pub fn replay_ledger(
    events: &[StreamEvent],
    messages: &[ChatMessage],
    config: &EngineConfig,
) -> LedgerReplay {
    let mut tools = ToolTracker::default();
    let mut chunks = ChunkStore::default();
    let mut first_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut checkpoints = Vec::new();

    for event in events {
        // Nested tool-internal streams never join the top-level timeline.
        if event.scope.is_some() {
            continue;
        }
        let ts = parse_timestamp(&event.received_at);
        match &event.payload {
            EventPayload::OutputItemAdded { item } if item.is_tool_call() => {
                tools.upsert_from_item(item);
                note_first_seen(&mut first_seen, &item.id, ts);
            }
            EventPayload::ToolStatus { call } => {
                tools.apply_status(call);
                note_first_seen(&mut first_seen, &call.call_id, ts);
            }
            EventPayload::ToolArgumentsDelta { call_id, delta } => {
                tools.apply_arguments_delta(call_id, delta);
                note_first_seen(&mut first_seen, call_id, ts);
            }
            EventPayload::ToolArgumentsDone { call_id, arguments } => {
                tools.apply_arguments_done(call_id, arguments);
                note_first_seen(&mut first_seen, call_id, ts);
            }
            EventPayload::ToolCodeDelta { call_id, delta } => {
                tools.apply_code_delta(call_id, delta);
                note_first_seen(&mut first_seen, call_id, ts);
            }
            EventPayload::ToolCodeDone { call_id, code } => {
                tools.apply_code_done(call_id, code);
                note_first_seen(&mut first_seen, call_id, ts);
            }
            EventPayload::ToolOutput {
                call_id,
                output,
                error,
            } => {
                tools.apply_output(call_id, output.clone(), error.clone());
                note_first_seen(&mut first_seen, call_id, ts);
            }
            EventPayload::ToolApproval { call_id, request } => {
                tools.apply_approval(call_id, request.clone());
                note_first_seen(&mut first_seen, call_id, ts);
            }
            EventPayload::ChunkDelta {
                target,
                chunk_index,
                data,
                encoding,
                format,
            } => {
                chunks.apply_delta(target, *chunk_index, data, *encoding, format.as_deref());
            }
            EventPayload::ChunkDone { target } => {
                if let Some(chunk) = chunks.take(target) {
                    deliver_chunk(&mut tools, target, chunk, &config.default_image_format);
                    note_first_seen(&mut first_seen, &target.entity_id, ts);
                }
            }
            EventPayload::MemoryCheckpoint { checkpoint } => {
                checkpoints.push(checkpoint_marker(checkpoint, &event.received_at));
            }
            _ => {}
        }
    }

    // Timestamp-sorted index of non-marker messages for anchoring.
    let mut index: Vec<(DateTime<Utc>, String)> = messages
        .iter()
        .filter(|message| !message.is_marker())
        .filter_map(|message| message.parsed_timestamp().map(|ts| (ts, message.id.clone())))
        .collect();
    index.sort();

    let mut anchors: ToolAnchors = IndexMap::new();
    let mut kept = Vec::new();
    for call in tools.snapshot() {
        let Some(seen) = first_seen.get(&call.id) else {
            debug!(call_id = %call.id, "tool has no usable timestamp; dropped");
            continue;
        };
        match nearest_preceding(&index, *seen) {
            Some(message_id) => {
                anchors.entry(message_id).or_default().push(call.id.clone());
                kept.push(call);
            }
            None => {
                debug!(
                    call_id = %call.id,
                    "tool precedes the earliest loaded message; dropped"
                );
            }
        }
    }

    LedgerReplay {
        timeline: ToolTimeline {
            tools: kept,
            anchors,
        },
        checkpoints,
    }
}

impl ToolTimeline {
    /// Merge a persisted timeline with a still-live one: tool records merge
    /// by id with live fields taking precedence field-by-field, and after
    /// unioning the anchor maps every tool id survives only in its
    /// last-occurring bucket.
    pub fn merge(persisted: &ToolTimeline, live: &ToolTimeline) -> ToolTimeline {
        let mut by_id: IndexMap<String, ToolCallState> = IndexMap::new();
        for call in &persisted.tools {
            by_id.insert(call.id.clone(), call.clone());
        }
        for call in &live.tools {
            match by_id.get(&call.id) {
                Some(existing) => {
                    let merged = merge_call(existing, call);
                    by_id.insert(call.id.clone(), merged);
                }
                None => {
                    by_id.insert(call.id.clone(), call.clone());
                }
            }
        }
        let mut tools: Vec<ToolCallState> = by_id.into_values().collect();
        tools.sort_by(|a, b| (a.output_index, &a.id).cmp(&(b.output_index, &b.id)));

        ToolTimeline {
            tools,
            anchors: merge_anchors(&persisted.anchors, &live.anchors),
        }
    }
}

/// Live wins field-by-field; fields the live side has not produced yet fall
/// back to the persisted record, and status never regresses in rank.
fn merge_call(persisted: &ToolCallState, live: &ToolCallState) -> ToolCallState {
    ToolCallState {
        id: live.id.clone(),
        name: if live.name.is_empty() {
            persisted.name.clone()
        } else {
            live.name.clone()
        },
        family: if live.family == weft_protocol::ToolFamily::Unknown {
            persisted.family
        } else {
            live.family
        },
        status: if live.status.rank() >= persisted.status.rank() {
            live.status
        } else {
            persisted.status
        },
        input: live.input.clone().or_else(|| persisted.input.clone()),
        output: live.output.clone().or_else(|| persisted.output.clone()),
        output_index: live.output_index,
        error_text: live
            .error_text
            .clone()
            .or_else(|| persisted.error_text.clone()),
        approval: live.approval.clone().or_else(|| persisted.approval.clone()),
    }
}

/// Union per-message tool-id lists, then keep each tool id only in its
/// last-occurring bucket so every tool has exactly one anchor.
pub fn merge_anchors(persisted: &ToolAnchors, live: &ToolAnchors) -> ToolAnchors {
    let mut merged: ToolAnchors = IndexMap::new();
    for (message_id, ids) in persisted.iter().chain(live.iter()) {
        merged
            .entry(message_id.clone())
            .or_default()
            .extend(ids.iter().cloned());
    }

    let mut last_bucket: HashMap<String, String> = HashMap::new();
    for (message_id, ids) in &merged {
        for id in ids {
            last_bucket.insert(id.clone(), message_id.clone());
        }
    }
    for (message_id, ids) in merged.iter_mut() {
        let mut seen = HashSet::new();
        ids.retain(|id| {
            last_bucket.get(id).is_some_and(|m| m == message_id) && seen.insert(id.clone())
        });
    }
    merged.retain(|_, ids| !ids.is_empty());
    merged
}

/// Re-point anchors after an optimistic message is promoted to its
/// persisted counterpart: match by `(role, normalized content)` signature
/// between the old and new message lists, and drop the anchor rather than
/// guess when no unambiguous match exists.
pub fn reanchor_promoted(
    anchors: &ToolAnchors,
    old_messages: &[ChatMessage],
    new_messages: &[ChatMessage],
    config: &EngineConfig,
) -> ToolAnchors {
    let mut result: ToolAnchors = IndexMap::new();
    for (message_id, ids) in anchors {
        let target = if new_messages.iter().any(|m| &m.id == message_id) {
            Some(message_id.clone())
        } else if let Some(old) = old_messages.iter().find(|m| &m.id == message_id) {
            let wanted = signature(old, config);
            let mut matches = new_messages
                .iter()
                .filter(|candidate| signature(candidate, config) == wanted);
            match (matches.next(), matches.next()) {
                (Some(found), None) => Some(found.id.clone()),
                (_, Some(_)) => {
                    debug!(message_id = %message_id, "ambiguous promotion target; anchor dropped");
                    None
                }
                _ => {
                    debug!(message_id = %message_id, "no promotion target; anchor dropped");
                    None
                }
            }
        } else {
            debug!(message_id = %message_id, "anchored message vanished; anchor dropped");
            None
        };
        if let Some(target) = target {
            result
                .entry(target)
                .or_default()
                .extend(ids.iter().cloned());
        }
    }
    for ids in result.values_mut() {
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
    }
    result
}

/// Zero-content marker message carrying the checkpoint payload, interleaved
/// into the timeline at its own timestamp.
fn checkpoint_marker(checkpoint: &MemoryCheckpoint, received_at: &str) -> ChatMessage {
    ChatMessage {
        id: format!("checkpoint-{}", checkpoint.id),
        role: "system".to_string(),
        content: String::new(),
        timestamp: Some(received_at.to_string()),
        is_streaming: false,
        attachments: Vec::new(),
        structured_output: serde_json::to_value(checkpoint).ok(),
        citations: Vec::new(),
        kind: MessageKind::Checkpoint,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn note_first_seen(
    first_seen: &mut HashMap<String, DateTime<Utc>>,
    call_id: &str,
    ts: Option<DateTime<Utc>>,
) {
    if let Some(ts) = ts {
        first_seen.entry(call_id.to_string()).or_insert(ts);
    }
}

/// Greatest timestamp ≤ `ts`, by binary search over the sorted index.
fn nearest_preceding(index: &[(DateTime<Utc>, String)], ts: DateTime<Utc>) -> Option<String> {
    let cut = index.partition_point(|(entry_ts, _)| *entry_ts <= ts);
    if cut == 0 {
        None
    } else {
        Some(index[cut - 1].1.clone())
    }
}

/// The tools of a still-live turn as a mergeable timeline, all anchored to
/// the message the live turn is rendering into.
pub fn live_timeline(tools: Vec<ToolCallState>, anchor_message_id: &str) -> ToolTimeline {
    let mut anchors: ToolAnchors = IndexMap::new();
    if !tools.is_empty() {
        anchors.insert(
            anchor_message_id.to_string(),
            tools.iter().map(|call| call.id.clone()).collect(),
        );
    }
    ToolTimeline { tools, anchors }
}
