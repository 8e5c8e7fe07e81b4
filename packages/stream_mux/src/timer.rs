//! One-shot deadline usable as a `tokio::select!` branch.
//!
//! The cycle tick, mux reconnect delay and dedicated-client backoff are all
//! modelled as a `Deadline` owned by their actor: arm it, cancel it, and await
//! `fired()` in the actor loop. Runs on tokio's clock, so paused-time tests
//! drive it without real waits.

use std::time::Duration;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) to fire `after` from now.
    pub fn arm(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.at
    }

    /// Completes once the armed deadline passes, disarming it. Never
    /// completes while disarmed. Cancel safe: dropping the future leaves the
    /// deadline armed.
    pub async fn fired(&mut self) {
        match self.at {
            Some(at) => {
                sleep_until(at).await;
                self.at = None;
            }
            None => std::future::pending().await,
        }
    }
}
