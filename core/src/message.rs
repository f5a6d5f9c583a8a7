use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use weft_protocol::Attachment;
use weft_protocol::Citation;

/// Distinguishes ordinary chat messages from synthetic checkpoint markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Message,
    Checkpoint,
}

/// One rendered entry of the conversation timeline.
///
/// Identity: optimistic messages carry a locally-generated id whose last
/// segment embeds the approximate creation time in epoch milliseconds
/// (`user-1700000000000`); persisted messages carry a server-assigned id and
/// an authoritative timestamp.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    /// RFC 3339; optimistic messages carry the client wall clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub kind: MessageKind,
}

impl ChatMessage {
    pub fn is_marker(&self) -> bool {
        self.kind == MessageKind::Checkpoint
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// True when `id` looks locally generated: its last `-`-separated segment is
/// an epoch-milliseconds run of digits.
pub fn is_optimistic_id(id: &str) -> bool {
    optimistic_id_millis(id).is_some()
}

/// The creation time embedded in an optimistic id, when present.
pub fn optimistic_id_millis(id: &str) -> Option<i64> {
    let (_, suffix) = id.rsplit_once('-')?;
    if suffix.len() < 10 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
