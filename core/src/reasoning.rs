/// One named section of the reasoning summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningPart {
    pub title: Option<String>,
    pub text: String,
}

/// Accumulates the reasoning summary: a flat string plus, when the protocol
/// provides structured parts, an ordered list of named parts.
#[derive(Debug, Default)]
pub struct ReasoningAccumulator {
    text: String,
    parts: Vec<ReasoningPart>,
}

impl ReasoningAccumulator {
    /// Append a streamed delta and return the full accumulated text.
    pub fn push_delta(&mut self, delta: &str) -> &str {
        self.text.push_str(delta);
        if let Some(part) = self.parts.last_mut() {
            part.text.push_str(delta);
        }
        &self.text
    }

    /// Open a new named section; subsequent deltas accumulate into it.
    pub fn part_added(&mut self, title: Option<String>) {
        self.parts.push(ReasoningPart {
            title,
            text: String::new(),
        });
    }

    /// Authoritative complete text for one part. When it strictly extends
    /// what was streamed for that part, the suffix also lands in the flat
    /// text; otherwise the flat text is left alone.
    pub fn part_done(&mut self, part_index: u32, text: &str) {
        let idx = part_index as usize;
        while self.parts.len() <= idx {
            self.parts.push(ReasoningPart::default());
        }
        if let Some(suffix) = strict_suffix(&self.parts[idx].text, text) {
            self.text.push_str(suffix);
        }
        self.parts[idx].text = text.to_string();
    }

    /// Extend from the terminal event's reasoning text.
    ///
    /// Applies only when `full` is strictly longer than and prefixed by the
    /// accumulation; then the suffix delta is appended and returned. Anything
    /// else is ignored: the final event must never retroactively truncate or
    /// duplicate already-streamed reasoning.
    pub fn extend_from_final(&mut self, full: &str) -> Option<String> {
        let suffix = strict_suffix(&self.text, full)?.to_string();
        self.text.push_str(&suffix);
        if let Some(part) = self.parts.last_mut() {
            part.text.push_str(&suffix);
        }
        Some(suffix)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parts(&self) -> &[ReasoningPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.parts.is_empty()
    }
}

fn strict_suffix<'a>(current: &str, full: &'a str) -> Option<&'a str> {
    if full.len() > current.len() && full.starts_with(current) {
        Some(&full[current.len()..])
    } else {
        None
    }
}
