//! Consumer-visible session status.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Where a consumer's stream currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No channel assigned, or not started yet
    Idle,
    Connecting,
    /// Waiting out a backoff delay
    Reconnecting,
    /// Frames are arriving
    Playing,
    /// Retries exhausted; only a manual retry leaves this state
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Playing => "playing",
            SessionState::Error => "error",
        };
        f.pad(s)
    }
}

/// Snapshot published over a `watch` channel whenever it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub state: SessionState,
    pub retry_count: u32,
    /// Frames delivered in the last one-second window
    pub fps: u32,
    pub channel: Option<String>,
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn new(session_id: Uuid, channel: Option<String>) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            retry_count: 0,
            fps: 0,
            channel,
            last_error: None,
        }
    }
}
