use chrono::Duration;

/// Client-side tunables for the reconstruction engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum clock skew between an optimistic message and its persisted
    /// counterpart for the pair to still merge into one message.
    pub dedup_window: Duration,
    /// Marker appended to in-progress streamed text; stripped during content
    /// normalization so a streaming snapshot matches its settled form.
    pub cursor_marker: String,
    /// Image format assumed when a chunked frame does not declare one.
    pub default_image_format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::minutes(2),
            cursor_marker: "▌".to_string(),
            default_image_format: "png".to_string(),
        }
    }
}
