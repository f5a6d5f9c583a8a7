use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;
use ts_rs::TS;

/// Lifecycle of one streaming turn.
///
/// `Idle` is the client-side initial value and never appears on the wire;
/// everything else can be carried by a `lifecycle` event or the terminal
/// `final` response.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, Display, TS,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Idle,
    Created,
    InProgress,
    Completed,
    Incomplete,
    Failed,
    Refused,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Completed
                | TurnStatus::Incomplete
                | TurnStatus::Failed
                | TurnStatus::Refused
                | TurnStatus::Cancelled
        )
    }
}

/// Provider tool families this client knows how to project into generic
/// input/output fields. Unrecognized families deserialize as `Unknown` and
/// are carried through untouched.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, Display, TS,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolFamily {
    WebSearch,
    FileSearch,
    CodeExecution,
    ImageGeneration,
    Function,
    Remote,
    #[serde(other)]
    #[default]
    Unknown,
}

/// A citation attached to streamed message text. Offsets are byte offsets
/// into the assembled text of the item the citation was reported for.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Citation {
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        start_index: u32,
        end_index: u32,
    },
    File {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        start_index: u32,
        end_index: u32,
    },
    ContainerFile {
        container_id: String,
        file_id: String,
        start_index: u32,
        end_index: u32,
    },
}

/// A file produced or referenced by a turn, reported verbatim by the server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Shape of the item announced by `output_item_added` / `output_item_done`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, TS,
)]
#[serde(rename_all = "snake_case")]
pub enum OutputItemKind {
    Message,
    Reasoning,
    ToolCall,
    #[serde(other)]
    #[default]
    Other,
}

/// One entry of a response's output list. Tool-shaped items create a tool
/// lifecycle placeholder as soon as they are announced so display ordering
/// stays stable before the first tool-specific event arrives.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
pub struct OutputItem {
    pub id: String,
    pub item: OutputItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<ToolFamily>,
    /// Raw provider fields, kept opaque until the projection table reads them.
    #[serde(default)]
    pub details: Value,
}

impl OutputItem {
    pub fn is_tool_call(&self) -> bool {
        self.item == OutputItemKind::ToolCall
    }
}

/// Payload of a `tool_status` event.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
pub struct ToolStatusUpdate {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub family: ToolFamily,
    /// Provider-reported status string; mapped per family by the client.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_index: Option<u32>,
    #[serde(default)]
    pub details: Value,
}

/// Declared encoding of a chunked payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum ChunkEncoding {
    Base64,
    Utf8,
}

/// The entity a chunk sequence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum ChunkEntity {
    ToolCall,
    Message,
}

/// Composite key addressing one reassembly buffer: every `(entity, id,
/// field, part)` combination accumulates independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, TS)]
pub struct ChunkTarget {
    pub entity: ChunkEntity,
    pub entity_id: String,
    pub field: String,
    #[serde(default)]
    pub part_index: u32,
}

/// Envelope of the terminal `final` event, and also the response shape of
/// the non-streaming fallback call (the two must stay interchangeable).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, TS)]
pub struct FinalResponse {
    #[serde(default)]
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Authoritative rendered text; `None` means "use the assembled text".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Complete reasoning summary; may only extend what was streamed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// A memory/state checkpoint reported mid-conversation. Projected into a
/// zero-content marker message at its own timestamp.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, TS)]
pub struct MemoryCheckpoint {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub payload: Value,
}
