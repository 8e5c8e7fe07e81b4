//! Decoded frames and the sink interface consumers receive them through.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Prefix the console puts in front of per-task channel ids (`task/<session>`).
const TASK_PREFIX: &str = "task/";

/// How a frame arrived on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Base64 JPEG carried in a JSON text message
    Json,
    /// Raw binary message (no label)
    Binary,
}

/// A decoded video frame.
#[derive(Clone)]
pub struct Frame {
    /// JPEG bytes
    pub data: Bytes,
    /// Normalized label reported by the upstream, if any
    pub label: Option<String>,
    pub kind: FrameKind,
}

impl Frame {
    pub fn binary(data: Bytes) -> Self {
        Self {
            data,
            label: None,
            kind: FrameKind::Binary,
        }
    }

    pub fn labeled(data: Bytes, label: Option<String>) -> Self {
        Self {
            data,
            label,
            kind: FrameKind::Json,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Receives frames for one consumer.
///
/// Called from the owning actor's task while it walks its subscriber set, so
/// implementations must not block. Calling back into the multiplexer from
/// here is allowed: `unsubscribe` only enqueues a command, and the removal is
/// applied after the current dispatch pass.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: &Frame);
}

impl<F> FrameSink for F
where
    F: Fn(&Frame) + Send + Sync,
{
    fn deliver(&self, frame: &Frame) {
        self(frame)
    }
}

pub type SharedSink = Arc<dyn FrameSink>;

/// Case-fold and trim a reported label. Blank labels count as no label.
pub fn normalize_label(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Fallback match key for a requested channel: `task/` prefix stripped, trimmed.
pub fn channel_key(requested: &str) -> String {
    let trimmed = requested.trim();
    trimmed
        .strip_prefix(TASK_PREFIX)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}
