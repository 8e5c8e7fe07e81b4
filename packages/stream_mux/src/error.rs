use thiserror::Error;

/// Errors produced while translating upstream payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Text frame was not valid JSON (or not an object we understand)
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    /// `image` field was present but not valid base64
    #[error("invalid base64 image: {0}")]
    Base64(#[from] base64::DecodeError),
    /// JSON object carried neither an image nor an error
    #[error("payload has no image")]
    MissingImage,
    /// Image or binary payload decoded to zero bytes
    #[error("empty frame")]
    EmptyFrame,
}

/// Errors surfaced by the distribution engine to its callers.
///
/// Transport failures are normally absorbed by the multiplexer and dedicated
/// client (they reconnect); these only reach callers at API boundaries.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("stream actor is gone")]
    Closed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),
    #[error("channel id is empty")]
    EmptyChannel,
}

impl StreamError {
    pub(crate) fn connect(url: &str, reason: impl std::fmt::Display) -> Self {
        StreamError::Connect {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
