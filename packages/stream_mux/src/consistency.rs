//! Per-subscriber consecutive-match counter.
//!
//! A frame is only released to a subscriber once `required` frames in a row
//! have carried that subscriber's label. Any channel switch or foreign label
//! starts the run over.

/// Consecutive-match state for one subscriber.
#[derive(Debug, Clone)]
pub struct ConsistencyFilter {
    required: u32,
    matches: u32,
}

impl ConsistencyFilter {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            matches: 0,
        }
    }

    /// Record a frame carrying the expected label. Returns true once the run
    /// is long enough for the frame to be delivered.
    pub fn observe_match(&mut self) -> bool {
        self.matches = self.matches.saturating_add(1);
        self.matches >= self.required
    }

    /// Record a frame carrying some other label.
    pub fn observe_mismatch(&mut self) {
        self.matches = 0;
    }

    pub fn reset(&mut self) {
        self.matches = 0;
    }

    pub fn matches(&self) -> u32 {
        self.matches
    }

    pub fn required(&self) -> u32 {
        self.required
    }
}
