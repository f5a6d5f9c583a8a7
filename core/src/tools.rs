use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use weft_protocol::ChunkEntity;
use weft_protocol::ChunkTarget;
use weft_protocol::OutputItem;
use weft_protocol::ToolFamily;
use weft_protocol::ToolStatusUpdate;

use crate::chunks::AssembledChunk;

/// UI-facing status of one tool call.
///
/// Strictly ordered: a call only ever moves forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolStatus {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

impl ToolStatus {
    pub fn rank(self) -> u8 {
        match self {
            ToolStatus::InputStreaming => 0,
            ToolStatus::InputAvailable => 1,
            ToolStatus::OutputAvailable => 2,
            ToolStatus::OutputError => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ToolStatus::OutputAvailable | ToolStatus::OutputError)
    }
}

/// Everything the UI needs to render one tool call. Keyed by the call id for
/// the call's entire lifetime.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCallState {
    pub id: String,
    pub name: String,
    pub family: ToolFamily,
    pub status: ToolStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub output_index: u32,
    pub error_text: Option<String>,
    /// Pending approval request payload, when the server asked for one.
    pub approval: Option<Value>,
}

/// Per-turn tool call tracker.
///
/// Consumers receive full snapshots sorted by output index, never diffs:
/// every mutation re-broadcasts the whole set.
#[derive(Debug, Default)]
pub struct ToolTracker {
    calls: HashMap<String, ToolCallState>,
    arguments: HashMap<String, String>,
    code: HashMap<String, String>,
    frames: HashMap<String, BTreeMap<u32, String>>,
    next_output_index: u32,
}

impl ToolTracker {
    /// Create a placeholder for an announced tool call so display ordering
    /// is stable before the first tool-specific event arrives.
    pub fn upsert_from_item(&mut self, item: &OutputItem) {
        if !item.is_tool_call() {
            return;
        }
        let name = item.name.clone();
        let family = item.family;
        let output_index = item.output_index;
        self.ensure_call(&item.id, name.as_deref(), family, output_index);
    }

    pub fn apply_status(&mut self, update: &ToolStatusUpdate) {
        let mapped = map_provider_status(&update.status);
        let arguments = self.arguments.get(&update.call_id).cloned();
        let code = self.code.get(&update.call_id).cloned();
        let call = self.ensure_call(
            &update.call_id,
            update.name.as_deref(),
            Some(update.family),
            update.output_index,
        );
        if mapped.rank() > call.status.rank() {
            trace!(
                call_id = %update.call_id,
                from = ?call.status,
                to = ?mapped,
                "tool status advanced"
            );
            call.status = mapped;
        }
        if let Some(input) = project_input(
            call.family,
            &update.details,
            arguments.as_deref(),
            code.as_deref(),
        ) {
            call.input = Some(input);
        }
        if let Some(output) = project_output(call.family, &update.details) {
            call.output = Some(output);
        }
        if mapped == ToolStatus::OutputError {
            if let Some(message) = error_message(&update.details) {
                call.error_text = Some(message);
            }
        }
    }

    pub fn apply_arguments_delta(&mut self, call_id: &str, delta: &str) {
        self.arguments
            .entry(call_id.to_string())
            .or_default()
            .push_str(delta);
        self.reproject_input(call_id);
    }

    pub fn apply_arguments_done(&mut self, call_id: &str, arguments: &str) {
        self.arguments
            .insert(call_id.to_string(), arguments.to_string());
        self.reproject_input(call_id);
    }

    pub fn apply_code_delta(&mut self, call_id: &str, delta: &str) {
        self.code
            .entry(call_id.to_string())
            .or_default()
            .push_str(delta);
        self.reproject_input(call_id);
    }

    pub fn apply_code_done(&mut self, call_id: &str, code: &str) {
        self.code.insert(call_id.to_string(), code.to_string());
        self.reproject_input(call_id);
    }

    pub fn apply_output(&mut self, call_id: &str, output: Value, error: Option<String>) {
        let call = self.ensure_call(call_id, None, None, None);
        let mapped = match error {
            Some(_) => ToolStatus::OutputError,
            None => ToolStatus::OutputAvailable,
        };
        if mapped.rank() > call.status.rank() {
            call.status = mapped;
        }
        if call.family != ToolFamily::ImageGeneration {
            call.output = Some(output);
        }
        if let Some(message) = error {
            call.error_text = Some(message);
        }
    }

    pub fn apply_approval(&mut self, call_id: &str, request: Value) {
        let call = self.ensure_call(call_id, None, None, None);
        call.approval = Some(request);
    }

    /// Register a completed image frame for the call and republish its
    /// output as the frame list sorted by frame index.
    pub fn register_frame(&mut self, call_id: &str, part_index: u32, data_uri: String) {
        let frames = self.frames.entry(call_id.to_string()).or_default();
        frames.insert(part_index, data_uri);
        let list: Vec<Value> = frames
            .values()
            .map(|uri| Value::String(uri.clone()))
            .collect();
        let call = self.ensure_call(call_id, None, Some(ToolFamily::ImageGeneration), None);
        call.output = Some(Value::Array(list));
    }

    /// Full tool set sorted by output index. Snapshots, not diffs, are the
    /// contract consumers rely on.
    pub fn snapshot(&self) -> Vec<ToolCallState> {
        let mut calls: Vec<ToolCallState> = self.calls.values().cloned().collect();
        calls.sort_by(|a, b| (a.output_index, &a.id).cmp(&(b.output_index, &b.id)));
        calls
    }

    pub fn get(&self, call_id: &str) -> Option<&ToolCallState> {
        self.calls.get(call_id)
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn ensure_call(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        family: Option<ToolFamily>,
        output_index: Option<u32>,
    ) -> &mut ToolCallState {
        if let Some(index) = output_index {
            self.next_output_index = self.next_output_index.max(index + 1);
        }
        let next = &mut self.next_output_index;
        let call = self.calls.entry(call_id.to_string()).or_insert_with(|| {
            let assigned = match output_index {
                Some(index) => index,
                None => {
                    let index = *next;
                    *next += 1;
                    index
                }
            };
            debug!(call_id, "tool call created");
            ToolCallState {
                id: call_id.to_string(),
                name: String::new(),
                family: ToolFamily::Unknown,
                status: ToolStatus::InputStreaming,
                input: None,
                output: None,
                output_index: assigned,
                error_text: None,
                approval: None,
            }
        });
        if let Some(name) = name {
            if !name.is_empty() {
                call.name = name.to_string();
            }
        }
        if let Some(family) = family {
            if family != ToolFamily::Unknown {
                call.family = family;
            }
        }
        if let Some(index) = output_index {
            call.output_index = index;
        }
        call
    }

    fn reproject_input(&mut self, call_id: &str) {
        let arguments = self.arguments.get(call_id).cloned();
        let code = self.code.get(call_id).cloned();
        let call = self.ensure_call(call_id, None, None, None);
        if let Some(input) = project_input(
            call.family,
            &Value::Null,
            arguments.as_deref(),
            code.as_deref(),
        ) {
            call.input = Some(input);
        }
    }
}

/// Route an assembled chunk to its owning tool call. Image payloads become
/// data-URI frames; anything else lands in the call's output verbatim.
pub(crate) fn deliver_chunk(
    tools: &mut ToolTracker,
    target: &ChunkTarget,
    chunk: AssembledChunk,
    default_format: &str,
) {
    if target.entity != ChunkEntity::ToolCall {
        debug!(?target, "chunk for non-tool entity dropped");
        return;
    }
    if target.field == "image" {
        let uri = chunk.into_data_uri(default_format);
        tools.register_frame(&target.entity_id, target.part_index, uri);
    } else {
        tools.apply_output(&target.entity_id, Value::String(chunk.data), None);
    }
}

/// Provider status strings map identically across tool families.
fn map_provider_status(status: &str) -> ToolStatus {
    match status {
        "completed" => ToolStatus::OutputAvailable,
        "failed" => ToolStatus::OutputError,
        _ => ToolStatus::InputAvailable,
    }
}

/// Which raw provider fields become the generic `input` projection.
fn project_input(
    family: ToolFamily,
    details: &Value,
    arguments: Option<&str>,
    code: Option<&str>,
) -> Option<Value> {
    match family {
        ToolFamily::WebSearch => details
            .get("query")
            .cloned()
            .or_else(|| details.pointer("/action/query").cloned()),
        ToolFamily::FileSearch => details
            .get("queries")
            .cloned()
            .or_else(|| details.get("query").cloned()),
        ToolFamily::CodeExecution => code
            .map(|c| Value::String(c.to_string()))
            .or_else(|| details.get("code").cloned()),
        ToolFamily::ImageGeneration => details.get("prompt").cloned(),
        ToolFamily::Function | ToolFamily::Remote | ToolFamily::Unknown => arguments
            .map(parse_arguments)
            .or_else(|| details.get("arguments").cloned()),
    }
}

/// Which raw provider fields become the generic `output` projection. Image
/// generation publishes frames instead, so it never projects from details.
fn project_output(family: ToolFamily, details: &Value) -> Option<Value> {
    match family {
        ToolFamily::WebSearch | ToolFamily::FileSearch => details.get("results").cloned(),
        ToolFamily::CodeExecution => details
            .get("outputs")
            .cloned()
            .or_else(|| details.get("logs").cloned()),
        ToolFamily::ImageGeneration => None,
        ToolFamily::Function | ToolFamily::Remote | ToolFamily::Unknown => {
            details.get("output").cloned()
        }
    }
}

fn parse_arguments(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn error_message(details: &Value) -> Option<String> {
    details
        .pointer("/error/message")
        .or_else(|| details.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
