//! Wire codec for the upstream video socket.
//!
//! Outbound: `{"chn": "<channel-id>"}` selects the active channel.
//!
//! Inbound text: `{"image": "<base64 JPEG>", "task": "<label>"}`, `{"error": ".."}`
//! or a bare `pong` keep-alive. Inbound binary: raw JPEG bytes, no label.
//!
//! Stateless: buffering and retries live in the multiplexer and dedicated client.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CodecError;
use crate::frame::{Frame, normalize_label};

const KEEPALIVE_REPLY: &str = "pong";

/// A decoded inbound message.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// The upstream reported an error for this connection
    UpstreamError(String),
    KeepAlive,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    image: Option<String>,
    #[serde(default, alias = "label")]
    task: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Build the channel-selection message.
pub fn encode_select(channel: &str) -> String {
    serde_json::json!({ "chn": channel }).to_string()
}

/// Decode an inbound text message.
pub fn decode_text(text: &str) -> Result<Inbound, CodecError> {
    if text.trim() == KEEPALIVE_REPLY {
        return Ok(Inbound::KeepAlive);
    }

    let raw: RawMessage = serde_json::from_str(text)?;

    if let Some(error) = raw.error.filter(|e| !e.is_null()) {
        return Ok(Inbound::UpstreamError(value_text(&error)));
    }

    let image = raw.image.ok_or(CodecError::MissingImage)?;
    let data = STANDARD.decode(strip_data_url(&image))?;
    if data.is_empty() {
        return Err(CodecError::EmptyFrame);
    }

    let label = raw
        .task
        .as_ref()
        .and_then(|task| normalize_label(&value_text(task)));

    Ok(Inbound::Frame(Frame::labeled(Bytes::from(data), label)))
}

/// Decode an inbound binary message.
pub fn decode_binary(data: Bytes) -> Result<Inbound, CodecError> {
    if data.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    Ok(Inbound::Frame(Frame::binary(data)))
}

/// Labels and errors are usually strings, but numeric group ids show up too.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Accept `data:image/jpeg;base64,...` as well as bare base64.
fn strip_data_url(image: &str) -> &str {
    let image = image.trim();
    if image.starts_with("data:") {
        image.split_once(',').map(|(_, b64)| b64).unwrap_or(image)
    } else {
        image
    }
}
