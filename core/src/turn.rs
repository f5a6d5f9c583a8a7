use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use futures::Stream;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use weft_protocol::Attachment;
use weft_protocol::Citation;
use weft_protocol::EventPayload;
use weft_protocol::FinalResponse;
use weft_protocol::MemoryCheckpoint;
use weft_protocol::OutputItem;
use weft_protocol::StreamEvent;
use weft_protocol::TurnStatus;

use crate::chunks::ChunkStore;
use crate::citations::CitationAccumulator;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::error::StreamError;
use crate::reasoning::ReasoningAccumulator;
use crate::text::TextPartsStore;
use crate::tools::ToolCallState;
use crate::tools::ToolTracker;
use crate::tools::deliver_chunk;

/// Which text channel a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextChannel {
    Message,
    Refusal,
}

/// Incremental callbacks emitted while a turn is streaming.
///
/// Every method has a no-op default so consumers implement only what they
/// render. Identity callbacks fire the first time each value is observed,
/// never on repeats.
pub trait TurnObserver {
    fn on_conversation_id(&mut self, _id: &str) {}
    fn on_response_id(&mut self, _id: &str) {}
    fn on_agent(&mut self, _name: &str) {}
    fn on_status(&mut self, _status: TurnStatus) {}
    /// Full assembled text for the item after applying one delta or replace.
    fn on_text(&mut self, _channel: TextChannel, _item_id: &str, _text: &str) {}
    fn on_reasoning(&mut self, _delta: &str, _full: &str) {}
    /// Full tool snapshot sorted by output index.
    fn on_tools(&mut self, _tools: &[ToolCallState]) {}
    fn on_attachments(&mut self, _attachments: &[Attachment]) {}
    fn on_structured_output(&mut self, _value: &Value) {}
    fn on_error(&mut self, _error: &StreamError) {}
    fn on_item_added(&mut self, _item: &OutputItem) {}
    fn on_item_done(&mut self, _item: &OutputItem) {}
    fn on_checkpoint(&mut self, _checkpoint: &MemoryCheckpoint) {}
}

/// Cooperative cancellation handle. Checked before each event; once set, the
/// remaining events are skipped silently and whatever state was applied up
/// to that point is preserved.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Terminal output of one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnSummary {
    /// Rendered text of the turn; `None` when the turn errored or produced
    /// nothing.
    pub final_content: Option<String>,
    pub conversation_id: Option<String>,
    pub response_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub structured_output: Option<Value>,
    pub status: TurnStatus,
    pub citations: Vec<Citation>,
    pub terminal_seen: bool,
    pub errored: bool,
}

impl TurnSummary {
    /// Build the summary shape from the non-streaming fallback response so
    /// both paths stay interchangeable to downstream consumers.
    pub fn from_final_response(
        response: FinalResponse,
        conversation_id: Option<String>,
    ) -> Self {
        let status = if response.status == TurnStatus::Idle {
            TurnStatus::Completed
        } else {
            response.status
        };
        let final_content = response.response_text.clone().or_else(|| {
            if status == TurnStatus::Refused {
                response.refusal.clone()
            } else {
                None
            }
        });
        Self {
            final_content,
            conversation_id,
            response_id: response.response_id,
            attachments: response.attachments,
            structured_output: response.structured_output,
            status,
            citations: Vec::new(),
            terminal_seen: true,
            errored: false,
        }
    }
}

/// Key for the duplicate-delta guard: channel, item id, slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SeqKey {
    Text(TextChannel, String, u32),
    Reasoning(String),
}

/// Text accumulated for one nested tool-internal agent stream. Kept apart
/// from the top-level turn so nested output never pollutes it.
#[derive(Debug, Default)]
struct SubStream {
    text: TextPartsStore,
    reasoning: ReasoningAccumulator,
    last_item: Option<String>,
}

/// Runtime context of one streaming turn.
///
/// Created fresh per turn and discarded at turn end; owns every accumulator,
/// so no state survives across turns and no ambient mutable state exists.
pub struct Turn {
    config: EngineConfig,
    message_text: TextPartsStore,
    refusal_text: TextPartsStore,
    reasoning: ReasoningAccumulator,
    citations: CitationAccumulator,
    tools: ToolTracker,
    chunks: ChunkStore,
    conversation_id: Option<String>,
    response_id: Option<String>,
    agent: Option<String>,
    status: TurnStatus,
    last_message_item: Option<String>,
    last_refusal_item: Option<String>,
    final_response: Option<FinalResponse>,
    attachments: Vec<Attachment>,
    structured_output: Option<Value>,
    terminal_seen: bool,
    errored: bool,
    applied_seq: HashMap<SeqKey, u64>,
    sub_streams: HashMap<String, SubStream>,
}

impl Turn {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            message_text: TextPartsStore::default(),
            refusal_text: TextPartsStore::default(),
            reasoning: ReasoningAccumulator::default(),
            citations: CitationAccumulator::default(),
            tools: ToolTracker::default(),
            chunks: ChunkStore::default(),
            conversation_id: None,
            response_id: None,
            agent: None,
            status: TurnStatus::Idle,
            last_message_item: None,
            last_refusal_item: None,
            final_response: None,
            attachments: Vec::new(),
            structured_output: None,
            terminal_seen: false,
            errored: false,
            applied_seq: HashMap::new(),
            sub_streams: HashMap::new(),
        }
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn terminal_seen(&self) -> bool {
        self.terminal_seen
    }

    /// Assembled text of a nested tool-internal agent stream, when any.
    pub fn sub_stream_text(&self, tool_call_id: &str) -> Option<String> {
        let sub = self.sub_streams.get(tool_call_id)?;
        let item = sub.last_item.as_deref()?;
        Some(sub.text.assembled(item))
    }

    /// Process one event strictly in arrival order.
    pub fn apply<O: TurnObserver>(&mut self, event: StreamEvent, observer: &mut O) {
        if self.terminal_seen {
            trace!(sequence = event.sequence, "event after terminal ignored");
            return;
        }
        if let Some(scope) = &event.scope {
            let tool_call_id = scope.tool_call_id.clone();
            self.apply_scoped(&tool_call_id, event);
            return;
        }
        self.observe_identity(&event, observer);

        let sequence = event.sequence;
        match event.payload {
            EventPayload::Lifecycle { status } => {
                self.status = status;
                observer.on_status(status);
            }
            EventPayload::OutputItemAdded { item } => {
                if item.is_tool_call() {
                    self.tools.upsert_from_item(&item);
                    observer.on_tools(&self.tools.snapshot());
                }
                observer.on_item_added(&item);
            }
            EventPayload::OutputItemDone { item } => {
                observer.on_item_done(&item);
            }
            EventPayload::MessageDelta {
                item_id,
                content_index,
                delta,
            } => {
                let key = SeqKey::Text(TextChannel::Message, item_id.clone(), content_index);
                if self.is_duplicate(key, sequence) {
                    return;
                }
                let full = self.message_text.append_delta(&item_id, content_index, &delta);
                self.last_message_item = Some(item_id.clone());
                observer.on_text(TextChannel::Message, &item_id, &full);
            }
            EventPayload::MessageCitation { item_id, citation } => {
                self.citations.push(&item_id, citation);
            }
            EventPayload::ReasoningDelta { item_id, delta } => {
                let key = SeqKey::Reasoning(item_id);
                if self.is_duplicate(key, sequence) {
                    return;
                }
                let full = self.reasoning.push_delta(&delta);
                observer.on_reasoning(&delta, full);
            }
            EventPayload::ReasoningPartAdded { title, .. } => {
                self.reasoning.part_added(title);
            }
            EventPayload::ReasoningPartDone {
                part_index, text, ..
            } => {
                self.reasoning.part_done(part_index, &text);
                observer.on_reasoning("", self.reasoning.text());
            }
            EventPayload::RefusalDelta {
                item_id,
                content_index,
                delta,
            } => {
                let key = SeqKey::Text(TextChannel::Refusal, item_id.clone(), content_index);
                if self.is_duplicate(key, sequence) {
                    return;
                }
                let full = self.refusal_text.append_delta(&item_id, content_index, &delta);
                self.last_refusal_item = Some(item_id.clone());
                // Refusal is only live while the message channel is silent.
                if self.message_text.is_empty() {
                    observer.on_text(TextChannel::Refusal, &item_id, &full);
                }
            }
            EventPayload::RefusalDone {
                item_id,
                content_index,
                text,
            } => {
                let full = self.refusal_text.replace(&item_id, content_index, &text);
                self.last_refusal_item = Some(item_id.clone());
                if self.message_text.is_empty() {
                    observer.on_text(TextChannel::Refusal, &item_id, &full);
                }
            }
            EventPayload::ToolStatus { call } => {
                self.tools.apply_status(&call);
                observer.on_tools(&self.tools.snapshot());
            }
            EventPayload::ToolArgumentsDelta { call_id, delta } => {
                self.tools.apply_arguments_delta(&call_id, &delta);
                observer.on_tools(&self.tools.snapshot());
            }
            EventPayload::ToolArgumentsDone { call_id, arguments } => {
                self.tools.apply_arguments_done(&call_id, &arguments);
                observer.on_tools(&self.tools.snapshot());
            }
            EventPayload::ToolCodeDelta { call_id, delta } => {
                self.tools.apply_code_delta(&call_id, &delta);
                observer.on_tools(&self.tools.snapshot());
            }
            EventPayload::ToolCodeDone { call_id, code } => {
                self.tools.apply_code_done(&call_id, &code);
                observer.on_tools(&self.tools.snapshot());
            }
            EventPayload::ToolOutput {
                call_id,
                output,
                error,
            } => {
                self.tools.apply_output(&call_id, output, error);
                observer.on_tools(&self.tools.snapshot());
            }
            EventPayload::ToolApproval { call_id, request } => {
                self.tools.apply_approval(&call_id, request);
                observer.on_tools(&self.tools.snapshot());
            }
            EventPayload::ChunkDelta {
                target,
                chunk_index,
                data,
                encoding,
                format,
            } => {
                self.chunks
                    .apply_delta(&target, chunk_index, &data, encoding, format.as_deref());
            }
            EventPayload::ChunkDone { target } => {
                if let Some(chunk) = self.chunks.take(&target) {
                    deliver_chunk(
                        &mut self.tools,
                        &target,
                        chunk,
                        &self.config.default_image_format,
                    );
                    observer.on_tools(&self.tools.snapshot());
                }
            }
            EventPayload::MemoryCheckpoint { checkpoint } => {
                observer.on_checkpoint(&checkpoint);
            }
            EventPayload::AgentUpdated { name } => {
                if self.agent.as_deref() != Some(name.as_str()) {
                    self.agent = Some(name.clone());
                    observer.on_agent(&name);
                }
            }
            EventPayload::Error { message, code } => {
                let error = StreamError::Response { message, code };
                self.fail(&error, observer);
            }
            EventPayload::Final { response } => {
                self.complete(response, observer);
            }
            EventPayload::Unknown => {
                let error = StreamError::Malformed(format!(
                    "unrecognized event kind at sequence {sequence}"
                ));
                self.fail(&error, observer);
            }
            _ => {
                let error = StreamError::Malformed(format!(
                    "unrecognized event kind at sequence {sequence}"
                ));
                self.fail(&error, observer);
            }
        }
    }

    /// Terminate as failed: the error is reported, partial accumulated state
    /// stays inspectable, and the summary carries no content.
    pub fn fail<O: TurnObserver>(&mut self, error: &StreamError, observer: &mut O) {
        warn!(%error, "turn failed");
        self.errored = true;
        self.terminal_seen = true;
        self.status = TurnStatus::Failed;
        observer.on_error(error);
        observer.on_status(TurnStatus::Failed);
    }

    /// Resolve the turn after the source is exhausted or terminated.
    pub fn finish(&mut self) -> TurnSummary {
        if !self.terminal_seen && self.status != TurnStatus::Cancelled {
            // Stream closed early. Infer refusal from accumulated refusal
            // text; otherwise keep the last observed status. Never promote
            // to completed.
            if !self.refusal_text.is_empty() {
                self.status = TurnStatus::Refused;
            }
            debug!(status = %self.status, "stream closed without terminal event");
        }

        let final_content = if self.errored {
            None
        } else {
            self.final_override().or_else(|| self.active_text())
        };

        let citations = self.resolve_citations();

        TurnSummary {
            final_content,
            conversation_id: self.conversation_id.clone(),
            response_id: self.response_id.clone(),
            attachments: self.attachments.clone(),
            structured_output: self.structured_output.clone(),
            status: self.status,
            citations,
            terminal_seen: self.terminal_seen,
            errored: self.errored,
        }
    }

    fn complete<O: TurnObserver>(&mut self, response: FinalResponse, observer: &mut O) {
        self.terminal_seen = true;
        self.status = if response.status == TurnStatus::Idle {
            TurnStatus::Completed
        } else {
            response.status
        };
        if let Some(id) = &response.response_id {
            if self.response_id.as_deref() != Some(id.as_str()) {
                self.response_id = Some(id.clone());
                observer.on_response_id(id);
            }
        }
        // The final event extends, never replaces, the reasoning summary.
        if let Some(reasoning) = response.reasoning.as_deref() {
            if let Some(suffix) = self.reasoning.extend_from_final(reasoning) {
                observer.on_reasoning(&suffix, self.reasoning.text());
            }
        }
        if !response.attachments.is_empty() {
            self.attachments = response.attachments.clone();
            observer.on_attachments(&self.attachments);
        }
        if let Some(value) = &response.structured_output {
            self.structured_output = Some(value.clone());
            observer.on_structured_output(value);
        }
        self.final_response = Some(response);
        observer.on_status(self.status);
    }

    /// Explicit final response text, else refusal text when the turn was
    /// refused, else `None` (meaning: use the assembled channel text).
    fn final_override(&self) -> Option<String> {
        let response = self.final_response.as_ref()?;
        if let Some(text) = &response.response_text {
            return Some(text.clone());
        }
        if self.status == TurnStatus::Refused {
            if let Some(refusal) = &response.refusal {
                return Some(refusal.clone());
            }
            let assembled = self.assembled_refusal();
            if !assembled.is_empty() {
                return Some(assembled);
            }
        }
        None
    }

    /// Assembled text of whichever channel is active: message wins for the
    /// remainder of the turn once it has produced any text.
    fn active_text(&self) -> Option<String> {
        if !self.message_text.is_empty() {
            let item = self.last_message_item.as_deref()?;
            return Some(self.message_text.assembled(item));
        }
        if !self.refusal_text.is_empty() {
            return Some(self.assembled_refusal());
        }
        None
    }

    fn assembled_refusal(&self) -> String {
        self.last_refusal_item
            .as_deref()
            .map(|item| self.refusal_text.assembled(item))
            .unwrap_or_default()
    }

    /// Citations scoped to the last-active item when any exist, else the
    /// union of everything collected.
    fn resolve_citations(&self) -> Vec<Citation> {
        let last_item = if !self.message_text.is_empty() {
            self.last_message_item.as_deref()
        } else {
            self.last_refusal_item.as_deref()
        };
        if let Some(item) = last_item {
            let scoped = self.citations.for_item(item);
            if !scoped.is_empty() {
                return scoped.to_vec();
            }
        }
        self.citations.union()
    }

    fn observe_identity<O: TurnObserver>(&mut self, event: &StreamEvent, observer: &mut O) {
        if let Some(id) = &event.conversation_id {
            if self.conversation_id.as_deref() != Some(id.as_str()) {
                self.conversation_id = Some(id.clone());
                observer.on_conversation_id(id);
            }
        }
        if let Some(id) = &event.response_id {
            if self.response_id.as_deref() != Some(id.as_str()) {
                self.response_id = Some(id.clone());
                observer.on_response_id(id);
            }
        }
        if let Some(name) = &event.agent {
            if self.agent.as_deref() != Some(name.as_str()) {
                self.agent = Some(name.clone());
                observer.on_agent(name);
            }
        }
    }

    fn is_duplicate(&mut self, key: SeqKey, sequence: u64) -> bool {
        match self.applied_seq.get(&key) {
            Some(last) if *last >= sequence => {
                trace!(sequence, "duplicate or out-of-order delta dropped");
                true
            }
            _ => {
                self.applied_seq.insert(key, sequence);
                false
            }
        }
    }

    /// Nested tool-internal agent streams accumulate separately and never
    /// update top-level identity or lifecycle.
    fn apply_scoped(&mut self, tool_call_id: &str, event: StreamEvent) {
        let sub = self.sub_streams.entry(tool_call_id.to_string()).or_default();
        match event.payload {
            EventPayload::MessageDelta {
                item_id,
                content_index,
                delta,
            } => {
                sub.text.append_delta(&item_id, content_index, &delta);
                sub.last_item = Some(item_id);
            }
            EventPayload::ReasoningDelta { delta, .. } => {
                sub.reasoning.push_delta(&delta);
            }
            _ => {
                trace!(
                    tool_call_id,
                    sequence = event.sequence,
                    "scoped event ignored"
                );
            }
        }
    }
}

/// Drive a whole turn: process events strictly in arrival order until the
/// source ends or a terminal event arrives, then resolve the summary.
pub async fn run_turn<S, O>(
    mut events: S,
    turn: &mut Turn,
    observer: &mut O,
    cancel: &CancelFlag,
) -> TurnSummary
where
    S: Stream<Item = Result<StreamEvent>> + Unpin,
    O: TurnObserver,
{
    while let Some(next) = events.next().await {
        if cancel.is_cancelled() {
            debug!("turn cancelled; skipping remaining events");
            if !turn.terminal_seen {
                turn.status = TurnStatus::Cancelled;
                observer.on_status(TurnStatus::Cancelled);
            }
            break;
        }
        match next {
            Ok(event) => turn.apply(event, observer),
            Err(error) => {
                turn.fail(&error, observer);
                break;
            }
        }
        if turn.terminal_seen {
            break;
        }
    }
    turn.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use weft_protocol::EventScope;
    use weft_protocol::ToolFamily;
    use weft_protocol::ToolStatusUpdate;

    // ────────────────────────────
    // Helpers
    // ────────────────────────────

    fn event(sequence: u64, payload: EventPayload) -> StreamEvent {
        StreamEvent {
            sequence,
            stream_id: "stream-1".to_string(),
            received_at: "2026-01-05T12:00:00Z".to_string(),
            conversation_id: Some("conv-1".to_string()),
            response_id: Some("resp-1".to_string()),
            agent: None,
            scope: None,
            payload,
        }
    }

    fn message_delta(sequence: u64, delta: &str) -> StreamEvent {
        event(
            sequence,
            EventPayload::MessageDelta {
                item_id: "msg_1".to_string(),
                content_index: 0,
                delta: delta.to_string(),
            },
        )
    }

    fn final_event(sequence: u64, response: FinalResponse) -> StreamEvent {
        event(sequence, EventPayload::Final { response })
    }

    fn completed(response_text: Option<&str>) -> FinalResponse {
        FinalResponse {
            status: TurnStatus::Completed,
            response_text: response_text.map(str::to_string),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        texts: Vec<(TextChannel, String)>,
        statuses: Vec<TurnStatus>,
        conversation_ids: Vec<String>,
        reasoning: Vec<String>,
        tool_snapshots: Vec<Vec<ToolCallState>>,
        errors: Vec<StreamError>,
    }

    impl TurnObserver for Recorder {
        fn on_conversation_id(&mut self, id: &str) {
            self.conversation_ids.push(id.to_string());
        }
        fn on_status(&mut self, status: TurnStatus) {
            self.statuses.push(status);
        }
        fn on_text(&mut self, channel: TextChannel, _item_id: &str, text: &str) {
            self.texts.push((channel, text.to_string()));
        }
        fn on_reasoning(&mut self, _delta: &str, full: &str) {
            self.reasoning.push(full.to_string());
        }
        fn on_tools(&mut self, tools: &[ToolCallState]) {
            self.tool_snapshots.push(tools.to_vec());
        }
        fn on_error(&mut self, error: &StreamError) {
            self.errors.push(error.clone());
        }
    }

    async fn drive(events: Vec<StreamEvent>) -> (TurnSummary, Recorder) {
        let mut turn = Turn::new(EngineConfig::default());
        let mut recorder = Recorder::default();
        let cancel = CancelFlag::new();
        let source = stream::iter(events.into_iter().map(Ok));
        let summary = run_turn(source, &mut turn, &mut recorder, &cancel).await;
        (summary, recorder)
    }

    // ────────────────────────────
    // Scenarios
    // ────────────────────────────

    #[tokio::test]
    async fn deltas_assemble_when_final_has_no_override() {
        let (summary, recorder) = drive(vec![
            message_delta(1, "Hel"),
            message_delta(2, "lo"),
            final_event(3, completed(None)),
        ])
        .await;
        assert_eq!(summary.final_content.as_deref(), Some("Hello"));
        assert_eq!(summary.status, TurnStatus::Completed);
        assert!(summary.terminal_seen);
        assert!(!summary.errored);
        assert_eq!(
            recorder.texts,
            vec![
                (TextChannel::Message, "Hel".to_string()),
                (TextChannel::Message, "Hello".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn final_response_text_overrides_assembled_deltas() {
        let (summary, _) = drive(vec![
            message_delta(1, "partial"),
            final_event(2, completed(Some("Override"))),
        ])
        .await;
        assert_eq!(summary.final_content.as_deref(), Some("Override"));
    }

    #[tokio::test]
    async fn completed_tool_before_final_leaves_content_unaffected() {
        let update = ToolStatusUpdate {
            call_id: "ws_1".to_string(),
            name: Some("web_search".to_string()),
            family: ToolFamily::WebSearch,
            status: "completed".to_string(),
            output_index: Some(0),
            details: json!({"action": {"query": "weather"}}),
        };
        let (summary, recorder) = drive(vec![
            message_delta(1, "Sunny"),
            event(2, EventPayload::ToolStatus { call: update }),
            final_event(3, completed(None)),
        ])
        .await;
        let last = recorder.tool_snapshots.last().expect("snapshot");
        assert_eq!(last[0].status, crate::tools::ToolStatus::OutputAvailable);
        assert_eq!(summary.final_content.as_deref(), Some("Sunny"));
    }

    #[tokio::test]
    async fn identity_callbacks_fire_once_per_value() {
        let (_, recorder) = drive(vec![
            message_delta(1, "a"),
            message_delta(2, "b"),
            final_event(3, completed(None)),
        ])
        .await;
        assert_eq!(recorder.conversation_ids, vec!["conv-1".to_string()]);
    }

    #[tokio::test]
    async fn error_event_fails_the_turn_and_discards_content() {
        let (summary, recorder) = drive(vec![
            message_delta(1, "half an ans"),
            event(
                2,
                EventPayload::Error {
                    message: "overloaded".to_string(),
                    code: Some("server_error".to_string()),
                },
            ),
        ])
        .await;
        assert_eq!(summary.final_content, None);
        assert_eq!(summary.status, TurnStatus::Failed);
        assert!(summary.errored);
        assert!(summary.terminal_seen);
        assert_eq!(recorder.errors.len(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_reported_as_malformed() {
        let (summary, recorder) = drive(vec![event(1, EventPayload::Unknown)]).await;
        assert!(summary.errored);
        assert_matches!(recorder.errors[0], StreamError::Malformed(_));
    }

    #[tokio::test]
    async fn early_close_with_refusal_text_infers_refused() {
        let (summary, _) = drive(vec![event(
            1,
            EventPayload::RefusalDelta {
                item_id: "ref_1".to_string(),
                content_index: 0,
                delta: "I cannot help with that.".to_string(),
            },
        )])
        .await;
        assert_eq!(summary.status, TurnStatus::Refused);
        assert!(!summary.terminal_seen);
        assert_eq!(
            summary.final_content.as_deref(),
            Some("I cannot help with that.")
        );
    }

    #[tokio::test]
    async fn early_close_without_terminal_keeps_last_status() {
        let (summary, _) = drive(vec![
            event(
                1,
                EventPayload::Lifecycle {
                    status: TurnStatus::InProgress,
                },
            ),
            message_delta(2, "unfinished"),
        ])
        .await;
        assert_eq!(summary.status, TurnStatus::InProgress);
        assert!(!summary.terminal_seen);
    }

    #[tokio::test]
    async fn refusal_done_replaces_rather_than_appends() {
        let (summary, _) = drive(vec![
            event(
                1,
                EventPayload::RefusalDelta {
                    item_id: "ref_1".to_string(),
                    content_index: 0,
                    delta: "I can".to_string(),
                },
            ),
            event(
                2,
                EventPayload::RefusalDone {
                    item_id: "ref_1".to_string(),
                    content_index: 0,
                    text: "I cannot comply.".to_string(),
                },
            ),
            final_event(
                3,
                FinalResponse {
                    status: TurnStatus::Refused,
                    ..Default::default()
                },
            ),
        ])
        .await;
        assert_eq!(summary.final_content.as_deref(), Some("I cannot comply."));
        assert_eq!(summary.status, TurnStatus::Refused);
    }

    #[tokio::test]
    async fn message_text_silences_the_refusal_channel() {
        let (_, recorder) = drive(vec![
            message_delta(1, "real answer"),
            event(
                2,
                EventPayload::RefusalDelta {
                    item_id: "ref_1".to_string(),
                    content_index: 0,
                    delta: "stale refusal".to_string(),
                },
            ),
            final_event(3, completed(None)),
        ])
        .await;
        assert!(
            recorder
                .texts
                .iter()
                .all(|(channel, _)| *channel == TextChannel::Message)
        );
    }

    #[tokio::test]
    async fn final_reasoning_extends_but_never_truncates() {
        let (_, recorder) = drive(vec![
            event(
                1,
                EventPayload::ReasoningDelta {
                    item_id: "r_1".to_string(),
                    delta: "step one".to_string(),
                },
            ),
            final_event(
                2,
                FinalResponse {
                    status: TurnStatus::Completed,
                    reasoning: Some("step one, step two".to_string()),
                    ..Default::default()
                },
            ),
        ])
        .await;
        assert_eq!(
            recorder.reasoning.last().map(String::as_str),
            Some("step one, step two")
        );

        // A shorter final reasoning text is ignored outright.
        let (_, recorder) = drive(vec![
            event(
                1,
                EventPayload::ReasoningDelta {
                    item_id: "r_1".to_string(),
                    delta: "step one".to_string(),
                },
            ),
            final_event(
                2,
                FinalResponse {
                    status: TurnStatus::Completed,
                    reasoning: Some("step".to_string()),
                    ..Default::default()
                },
            ),
        ])
        .await;
        assert_eq!(
            recorder.reasoning.last().map(String::as_str),
            Some("step one")
        );
    }

    #[tokio::test]
    async fn duplicate_sequence_numbers_do_not_double_append() {
        let (summary, _) = drive(vec![
            message_delta(1, "Hel"),
            message_delta(1, "Hel"),
            message_delta(2, "lo"),
            final_event(3, completed(None)),
        ])
        .await;
        assert_eq!(summary.final_content.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn scoped_events_do_not_touch_top_level_state() {
        let mut nested = message_delta(2, "inner monologue");
        nested.scope = Some(EventScope {
            tool_call_id: "call_9".to_string(),
            agent: Some("researcher".to_string()),
        });
        nested.conversation_id = Some("conv-nested".to_string());
        let events = vec![message_delta(1, "outer"), nested, final_event(3, completed(None))];

        let mut turn = Turn::new(EngineConfig::default());
        let mut recorder = Recorder::default();
        let cancel = CancelFlag::new();
        let source = stream::iter(events.into_iter().map(Ok));
        let summary = run_turn(source, &mut turn, &mut recorder, &cancel).await;

        assert_eq!(summary.final_content.as_deref(), Some("outer"));
        assert_eq!(summary.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(recorder.conversation_ids, vec!["conv-1".to_string()]);
        assert_eq!(
            turn.sub_stream_text("call_9").as_deref(),
            Some("inner monologue")
        );
    }

    #[tokio::test]
    async fn citations_prefer_the_last_active_item() {
        let url = |u: &str| Citation::Url {
            url: u.to_string(),
            title: None,
            start_index: 0,
            end_index: 1,
        };
        let (summary, _) = drive(vec![
            message_delta(1, "answer"),
            event(
                2,
                EventPayload::MessageCitation {
                    item_id: "other_item".to_string(),
                    citation: url("https://other"),
                },
            ),
            event(
                3,
                EventPayload::MessageCitation {
                    item_id: "msg_1".to_string(),
                    citation: url("https://active"),
                },
            ),
            final_event(4, completed(None)),
        ])
        .await;
        assert_eq!(summary.citations, vec![url("https://active")]);
    }

    #[tokio::test]
    async fn stream_error_item_fails_the_turn() {
        let events: Vec<Result<StreamEvent>> = vec![
            Ok(message_delta(1, "so far")),
            Err(StreamError::Stream("connection reset".to_string())),
        ];
        let mut turn = Turn::new(EngineConfig::default());
        let mut recorder = Recorder::default();
        let cancel = CancelFlag::new();
        let summary = run_turn(stream::iter(events), &mut turn, &mut recorder, &cancel).await;
        assert!(summary.errored);
        assert_eq!(summary.status, TurnStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_events_without_rollback() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut turn = Turn::new(EngineConfig::default());
        turn.apply(message_delta(1, "kept"), &mut Recorder::default());
        let source = stream::iter(vec![Ok(message_delta(2, " dropped"))]);
        let mut recorder = Recorder::default();
        let summary = run_turn(source, &mut turn, &mut recorder, &cancel).await;
        assert_eq!(summary.status, TurnStatus::Cancelled);
        assert_eq!(summary.final_content.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn image_chunks_become_frames_on_the_owning_tool() {
        use weft_protocol::ChunkEncoding;
        use weft_protocol::ChunkEntity;
        use weft_protocol::ChunkTarget;

        let target = ChunkTarget {
            entity: ChunkEntity::ToolCall,
            entity_id: "img_1".to_string(),
            field: "image".to_string(),
            part_index: 0,
        };
        let (_, recorder) = drive(vec![
            event(
                1,
                EventPayload::ChunkDelta {
                    target: target.clone(),
                    chunk_index: 1,
                    data: "Zm8=".to_string(),
                    encoding: None,
                    format: None,
                },
            ),
            event(
                2,
                EventPayload::ChunkDelta {
                    target: target.clone(),
                    chunk_index: 0,
                    data: "aGk=".to_string(),
                    encoding: Some(ChunkEncoding::Base64),
                    format: Some("png".to_string()),
                },
            ),
            event(3, EventPayload::ChunkDone { target }),
            final_event(4, completed(None)),
        ])
        .await;
        let last = recorder.tool_snapshots.last().expect("snapshot");
        assert_eq!(
            last[0].output,
            Some(json!(["data:image/png;base64,aGk=Zm8="]))
        );
    }

    #[test]
    fn fallback_response_converts_to_the_same_summary_shape() {
        let summary = TurnSummary::from_final_response(
            FinalResponse {
                status: TurnStatus::Completed,
                response_id: Some("resp-9".to_string()),
                response_text: Some("non-streamed".to_string()),
                ..Default::default()
            },
            Some("conv-1".to_string()),
        );
        assert_eq!(summary.final_content.as_deref(), Some("non-streamed"));
        assert_eq!(summary.response_id.as_deref(), Some("resp-9"));
        assert!(summary.terminal_seen);
        assert!(!summary.errored);
    }
}
