use serde_json::Value;
use tracing::debug;

use weft_protocol::Attachment;
use weft_protocol::Citation;

use crate::message::ChatMessage;

/// Shallow patch applied by [`TimelineOp::Update`]. Only present fields
/// overwrite the target message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub timestamp: Option<String>,
    pub is_streaming: Option<bool>,
    pub attachments: Option<Vec<Attachment>>,
    pub structured_output: Option<Value>,
    pub citations: Option<Vec<Citation>>,
}

impl MessagePatch {
    fn apply_to(self, message: &mut ChatMessage) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(timestamp) = self.timestamp {
            message.timestamp = Some(timestamp);
        }
        if let Some(is_streaming) = self.is_streaming {
            message.is_streaming = is_streaming;
        }
        if let Some(attachments) = self.attachments {
            message.attachments = attachments;
        }
        if let Some(structured_output) = self.structured_output {
            message.structured_output = Some(structured_output);
        }
        if let Some(citations) = self.citations {
            message.citations = citations;
        }
    }
}

/// One transition of the ordered message list.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineOp {
    Append(ChatMessage),
    /// Insert relative to a named anchor id; appends when the anchor is
    /// absent.
    InsertBefore {
        anchor: String,
        message: ChatMessage,
    },
    InsertAfter {
        anchor: String,
        message: ChatMessage,
    },
    /// Shallow patch by id; no-op when the id is absent.
    Update { id: String, patch: MessagePatch },
    Remove { id: String },
    /// Sequential application; used to coalesce many updates into one
    /// notification.
    Batch(Vec<TimelineOp>),
}

/// Pure transition function over the ordered message list.
pub fn apply(mut messages: Vec<ChatMessage>, op: TimelineOp) -> Vec<ChatMessage> {
    match op {
        TimelineOp::Append(message) => messages.push(message),
        TimelineOp::InsertBefore { anchor, message } => match position(&messages, &anchor) {
            Some(index) => messages.insert(index, message),
            None => {
                debug!(anchor = %anchor, "insert anchor missing; appending");
                messages.push(message);
            }
        },
        TimelineOp::InsertAfter { anchor, message } => match position(&messages, &anchor) {
            Some(index) => messages.insert(index + 1, message),
            None => {
                debug!(anchor = %anchor, "insert anchor missing; appending");
                messages.push(message);
            }
        },
        TimelineOp::Update { id, patch } => {
            if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
                patch.apply_to(message);
            }
        }
        TimelineOp::Remove { id } => messages.retain(|m| m.id != id),
        TimelineOp::Batch(ops) => {
            for op in ops {
                messages = apply(messages, op);
            }
        }
    }
    messages
}

fn position(messages: &[ChatMessage], id: &str) -> Option<usize> {
    messages.iter().position(|m| m.id == id)
}

/// Coalesces many synchronous updates into one notification per flush.
///
/// A throttling discipline, not a concurrency primitive: ops are batched in
/// arrival order and never reordered. The host decides when to flush (timer,
/// frame callback, or immediately); `is_full` lets it flush eagerly once the
/// bound is hit.
#[derive(Debug)]
pub struct OpQueue {
    pending: Vec<TimelineOp>,
    max_pending: usize,
}

impl Default for OpQueue {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            max_pending: 256,
        }
    }
}

impl OpQueue {
    pub fn with_bound(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
        }
    }

    pub fn push(&mut self, op: TimelineOp) {
        self.pending.push(op);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_pending
    }

    /// Drain everything pending into a single batch op, or `None` when
    /// nothing is queued.
    pub fn drain(&mut self) -> Option<TimelineOp> {
        if self.pending.is_empty() {
            None
        } else {
            Some(TimelineOp::Batch(std::mem::take(&mut self.pending)))
        }
    }

    /// Apply everything pending to `messages` in one step.
    pub fn flush(&mut self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        match self.drain() {
            Some(batch) => apply(messages, batch),
            None => messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            role: "user".to_string(),
            content: id.to_string(),
            ..Default::default()
        }
    }

    fn ids(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn insert_relative_to_anchor() {
        let list = apply(Vec::new(), TimelineOp::Append(message("a")));
        let list = apply(list, TimelineOp::Append(message("c")));
        let list = apply(
            list,
            TimelineOp::InsertBefore {
                anchor: "c".to_string(),
                message: message("b"),
            },
        );
        let list = apply(
            list,
            TimelineOp::InsertAfter {
                anchor: "c".to_string(),
                message: message("d"),
            },
        );
        assert_eq!(ids(&list), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn missing_anchor_falls_back_to_append() {
        let list = apply(
            vec![message("a")],
            TimelineOp::InsertBefore {
                anchor: "ghost".to_string(),
                message: message("b"),
            },
        );
        assert_eq!(ids(&list), vec!["a", "b"]);
    }

    #[test]
    fn update_is_shallow_and_noop_when_absent() {
        let list = vec![message("a")];
        let list = apply(
            list,
            TimelineOp::Update {
                id: "a".to_string(),
                patch: MessagePatch {
                    content: Some("patched".to_string()),
                    ..Default::default()
                },
            },
        );
        assert_eq!(list[0].content, "patched");
        assert_eq!(list[0].role, "user");

        let unchanged = apply(
            list.clone(),
            TimelineOp::Update {
                id: "ghost".to_string(),
                patch: MessagePatch::default(),
            },
        );
        assert_eq!(unchanged, list);
    }

    #[test]
    fn batch_applies_sequentially_without_reordering() {
        let batch = TimelineOp::Batch(vec![
            TimelineOp::Append(message("a")),
            TimelineOp::Append(message("b")),
            TimelineOp::Remove {
                id: "a".to_string(),
            },
        ]);
        let list = apply(Vec::new(), batch);
        assert_eq!(ids(&list), vec!["b"]);
    }

    #[test]
    fn queue_coalesces_into_one_batch() {
        let mut queue = OpQueue::with_bound(2);
        assert!(queue.is_empty());
        queue.push(TimelineOp::Append(message("a")));
        queue.push(TimelineOp::Append(message("b")));
        assert!(queue.is_full());
        let list = queue.flush(Vec::new());
        assert_eq!(ids(&list), vec!["a", "b"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_none());
    }
}
