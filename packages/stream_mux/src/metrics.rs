//! Stream metrics for observability
//!
//! Counters for the shared multiplexer and the per-consumer frame-rate gauge.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Multiplexer-wide counters
#[derive(Debug, Default)]
pub struct MuxMetrics {
    // Connection metrics
    /// Upstream connections established
    pub connections_opened: AtomicU64,
    /// Reconnects scheduled after an unexpected close or failed connect
    pub reconnects_scheduled: AtomicU64,

    // Scheduling metrics
    /// Channel-selection messages sent
    pub channel_switches: AtomicU64,

    // Frame metrics
    /// Frames decoded from the upstream
    pub frames_received: AtomicU64,
    /// Frame deliveries to sinks (one frame may count several times)
    pub frames_delivered: AtomicU64,
    /// Frames discarded inside the settling window
    pub frames_settling: AtomicU64,
    /// Labeled frames that matched no subscriber or had not built a run yet
    pub frames_unmatched: AtomicU64,
    /// Unlabeled frames dropped because the target was ambiguous
    pub frames_ambiguous: AtomicU64,

    // Error metrics
    /// Payloads that failed to decode
    pub malformed_payloads: AtomicU64,
    /// Explicit `error` messages from the upstream
    pub upstream_errors: AtomicU64,
}

impl MuxMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_switched(&self) {
        self.channel_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_delivered(&self, count: usize) {
        self.frames_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn frame_settling(&self) {
        self.frames_settling.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_unmatched(&self) {
        self.frames_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_ambiguous(&self) {
        self.frames_ambiguous.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_payload(&self) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MuxMetricsSnapshot {
        MuxMetricsSnapshot {
            connections: ConnectionMetrics {
                opened: self.connections_opened.load(Ordering::Relaxed),
                reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            },
            channel_switches: self.channel_switches.load(Ordering::Relaxed),
            frames: FrameMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                delivered: self.frames_delivered.load(Ordering::Relaxed),
                settling: self.frames_settling.load(Ordering::Relaxed),
                unmatched: self.frames_unmatched.load(Ordering::Relaxed),
                ambiguous: self.frames_ambiguous.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                malformed: self.malformed_payloads.load(Ordering::Relaxed),
                upstream: self.upstream_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of multiplexer metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxMetricsSnapshot {
    pub connections: ConnectionMetrics,
    pub channel_switches: u64,
    pub frames: FrameMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub opened: u64,
    pub reconnects_scheduled: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub received: u64,
    pub delivered: u64,
    pub settling: u64,
    pub unmatched: u64,
    pub ambiguous: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub malformed: u64,
    pub upstream: u64,
}

/// Rolling one-second frame counter.
///
/// `record` is called per delivered frame; whoever owns the one-second tick
/// calls `tick`, which publishes the window count as the current rate and
/// starts a new window.
#[derive(Debug, Default)]
pub struct FrameRateMeter {
    window: AtomicU32,
    rate: AtomicU32,
    total: AtomicU64,
}

impl FrameRateMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.window.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current window. Returns the frames counted in it.
    pub fn tick(&self) -> u32 {
        let count = self.window.swap(0, Ordering::Relaxed);
        self.rate.store(count, Ordering::Relaxed);
        count
    }

    /// Frames in the last closed window.
    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Frames recorded since creation.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
