use thiserror::Error;

/// Failures the reconstruction engine can observe.
///
/// Transport retries, reconnection and backoff live outside this crate; the
/// engine only ever sees an error as an item of the event stream or as a
/// protocol-level `error` event, and reports it through the observer instead
/// of propagating a panic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Transport-level failure surfaced through the event stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Event with a missing or unrecognized `kind`.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// Protocol-level `error` event reported by the server.
    #[error("{message}")]
    Response {
        message: String,
        code: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, StreamError>;
