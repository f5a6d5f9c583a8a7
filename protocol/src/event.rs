use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use ts_rs::TS;

use crate::models::ChunkEncoding;
use crate::models::ChunkTarget;
use crate::models::Citation;
use crate::models::FinalResponse;
use crate::models::MemoryCheckpoint;
use crate::models::OutputItem;
use crate::models::ToolStatusUpdate;
use crate::models::TurnStatus;

/// Marks an event as belonging to a nested tool-internal agent stream.
///
/// Scoped events are accumulated separately and must not update the
/// top-level turn's identity or lifecycle.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
pub struct EventScope {
    /// Id of the tool call that owns the nested stream.
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// One decoded event from the public streaming feed.
///
/// The transport guarantees in-order delivery of events sharing a
/// `stream_id`; `sequence` is the server-assigned monotonic ordering id.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
pub struct StreamEvent {
    pub sequence: u64,
    pub stream_id: String,
    /// Server-side wall clock, RFC 3339.
    pub received_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<EventScope>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Kind-tagged body of a [`StreamEvent`].
///
/// Unrecognized kinds deserialize as `Unknown` so a vocabulary mismatch is
/// reported by the consumer instead of failing the whole feed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventPayload {
    /// Turn lifecycle transition.
    Lifecycle { status: TurnStatus },
    /// A new entry appeared in the response's output list.
    OutputItemAdded { item: OutputItem },
    /// An output entry finished; notification only, state is unchanged.
    OutputItemDone { item: OutputItem },
    /// Positional fragment of assistant message text.
    MessageDelta {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    MessageCitation { item_id: String, citation: Citation },
    /// Fragment of the reasoning summary.
    ReasoningDelta { item_id: String, delta: String },
    ReasoningPartAdded {
        item_id: String,
        #[serde(default)]
        part_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Authoritative complete text for one reasoning part.
    ReasoningPartDone {
        item_id: String,
        #[serde(default)]
        part_index: u32,
        text: String,
    },
    /// Positional fragment of refusal text.
    RefusalDelta {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    /// Authoritative complete refusal text; a full-slot replace, not an
    /// append.
    RefusalDone {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        text: String,
    },
    ToolStatus { call: ToolStatusUpdate },
    ToolArgumentsDelta { call_id: String, delta: String },
    ToolArgumentsDone { call_id: String, arguments: String },
    ToolCodeDelta { call_id: String, delta: String },
    ToolCodeDone { call_id: String, code: String },
    ToolOutput {
        call_id: String,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The server is asking for approval before running a tool.
    ToolApproval { call_id: String, request: Value },
    /// One fragment of a chunked binary/text payload.
    ChunkDelta {
        target: ChunkTarget,
        chunk_index: u32,
        data: String,
        /// Declared on the first delta; later deltas may omit it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<ChunkEncoding>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    /// Terminal event for one chunk target; consume the buffer exactly once.
    ChunkDone { target: ChunkTarget },
    MemoryCheckpoint { checkpoint: MemoryCheckpoint },
    AgentUpdated { name: String },
    /// Protocol-level failure; terminates the turn.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Terminal event of a successful stream.
    Final { response: FinalResponse },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// True for the two explicit terminal kinds.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Error { .. } | EventPayload::Final { .. }
        )
    }
}
