use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::StreamError;

// =============================================================================
// File config (serde view; the binary layers it with figment)
// =============================================================================

/// Placeholder replaced by the channel id in endpoint templates.
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";

/// How consumers are attached to the upstream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// All consumers share one time-sliced connection
    #[default]
    Shared,
    /// Every consumer gets its own connection
    Dedicated,
}

/// Tunables as they appear in `config.toml` (durations in milliseconds).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    /// Upstream WebSocket endpoint used by the shared connection
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Endpoint template for dedicated clients. `{channel}` is substituted;
    /// without it the channel is selected in-band. Defaults to `endpoint`.
    #[serde(default)]
    pub dedicated_endpoint: Option<String>,
    #[serde(default)]
    pub mode: DistributionMode,
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    #[serde(default = "default_settling_period_ms")]
    pub settling_period_ms: u64,
    #[serde(default = "default_required_consecutive_frames")]
    pub required_consecutive_frames: u32,
    #[serde(default = "default_mux_reconnect_delay_ms")]
    pub mux_reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    /// Channels offered by the static channel source
    #[serde(default)]
    pub channels: Vec<String>,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            dedicated_endpoint: None,
            mode: DistributionMode::default(),
            cycle_interval_ms: default_cycle_interval_ms(),
            settling_period_ms: default_settling_period_ms(),
            required_consecutive_frames: default_required_consecutive_frames(),
            mux_reconnect_delay_ms: default_mux_reconnect_delay_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_retries: default_max_retries(),
            auto_connect: default_auto_connect(),
            channels: Vec::new(),
        }
    }
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:8088/video".to_string()
}
fn default_cycle_interval_ms() -> u64 {
    800
}
fn default_settling_period_ms() -> u64 {
    200
}
fn default_required_consecutive_frames() -> u32 {
    2
}
fn default_mux_reconnect_delay_ms() -> u64 {
    3000
}
fn default_reconnect_base_delay_ms() -> u64 {
    2000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    10
}
fn default_auto_connect() -> bool {
    true
}

// =============================================================================
// Runtime config
// =============================================================================

/// A validated upstream endpoint, optionally templated on the channel id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    template: String,
}

impl Endpoint {
    pub fn parse(template: &str) -> Result<Self, StreamError> {
        let template = template.trim();
        let probe = template.replace(CHANNEL_PLACEHOLDER, "probe");
        let url = url::Url::parse(&probe)
            .map_err(|e| StreamError::InvalidConfig(format!("endpoint {template:?}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(StreamError::InvalidConfig(format!(
                "endpoint {template:?}: scheme must be ws or wss"
            )));
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    /// Whether the channel is part of the URL (switching needs a new socket).
    pub fn channel_in_url(&self) -> bool {
        self.template.contains(CHANNEL_PLACEHOLDER)
    }

    /// Concrete URL for a channel. Templates without a placeholder ignore it.
    pub fn url_for(&self, channel: &str) -> String {
        if !self.channel_in_url() {
            return self.template.clone();
        }
        let encoded: String = url::form_urlencoded::byte_serialize(channel.as_bytes()).collect();
        self.template.replace(CHANNEL_PLACEHOLDER, &encoded)
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

/// Timing knobs for the shared multiplexer.
#[derive(Clone, Debug)]
pub struct MuxSettings {
    pub cycle_interval: Duration,
    pub settling_period: Duration,
    pub required_consecutive_frames: u32,
    pub reconnect_delay: Duration,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self::from_file(&StreamFileConfig::default())
    }
}

impl MuxSettings {
    pub fn from_file(fc: &StreamFileConfig) -> Self {
        Self {
            cycle_interval: Duration::from_millis(fc.cycle_interval_ms),
            settling_period: Duration::from_millis(fc.settling_period_ms),
            required_consecutive_frames: fc.required_consecutive_frames.max(1),
            reconnect_delay: Duration::from_millis(fc.mux_reconnect_delay_ms),
        }
    }
}

/// Reconnect policy for dedicated clients.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from_file(&StreamFileConfig::default())
    }
}

impl BackoffConfig {
    pub fn from_file(fc: &StreamFileConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(fc.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(fc.reconnect_max_delay_ms),
            max_retries: fc.max_retries,
        }
    }
}

/// Resolved configuration used throughout the engine.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub endpoint: Endpoint,
    pub dedicated_endpoint: Endpoint,
    pub mode: DistributionMode,
    pub mux: MuxSettings,
    pub backoff: BackoffConfig,
    pub auto_connect: bool,
    pub channels: Vec<String>,
}

impl StreamConfig {
    pub fn from_file(fc: &StreamFileConfig) -> Result<Self, StreamError> {
        let endpoint = Endpoint::parse(&fc.endpoint)?;
        if endpoint.channel_in_url() {
            return Err(StreamError::InvalidConfig(
                "shared endpoint cannot be templated on the channel".to_string(),
            ));
        }
        let dedicated_endpoint = match fc.dedicated_endpoint.as_deref() {
            Some(template) => Endpoint::parse(template)?,
            None => endpoint.clone(),
        };
        if fc.reconnect_base_delay_ms > fc.reconnect_max_delay_ms {
            return Err(StreamError::InvalidConfig(
                "reconnect_base_delay_ms exceeds reconnect_max_delay_ms".to_string(),
            ));
        }

        Ok(Self {
            endpoint,
            dedicated_endpoint,
            mode: fc.mode,
            mux: MuxSettings::from_file(fc),
            backoff: BackoffConfig::from_file(fc),
            auto_connect: fc.auto_connect,
            channels: fc.channels.clone(),
        })
    }
}
