//! Video channel distribution over single-channel WebSocket upstreams.
//!
//! The upstream streams exactly one selected channel per connection and only
//! loosely tags frames with the channel they belong to. This crate offers two
//! ways to put many consumers on top of it:
//!
//! - [`StreamMultiplexer`] time-slices one shared connection across every
//!   requested channel and routes frames by label, delivering only after a
//!   settling window and a run of consistently labeled frames.
//! - [`DedicatedClient`] gives a consumer its own connection with an
//!   exponential-backoff reconnect state machine.
//!
//! [`StreamFacade`] picks one or the other based on configuration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stream_mux::{Frame, StreamConfig, StreamFacade, StreamFileConfig};
//!
//! # async fn run() -> Result<(), stream_mux::StreamError> {
//! let config = StreamConfig::from_file(&StreamFileConfig::default())?;
//! let facade = StreamFacade::with_websocket(config);
//! let sink = Arc::new(|frame: &Frame| println!("{} bytes", frame.data.len()));
//! let mut status = facade.subscribe("tile-1", "task/42", sink, None).await?;
//! status.changed().await.ok();
//! println!("{}", status.borrow().state);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod consistency;
pub mod cycle;
pub mod dedicated;
pub mod error;
pub mod facade;
pub mod frame;
pub mod metrics;
pub mod multiplexer;
pub mod source;
pub mod status;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use config::{
    BackoffConfig, DistributionMode, Endpoint, MuxSettings, StreamConfig, StreamFileConfig,
};
pub use dedicated::{Backoff, DedicatedClient, DedicatedOptions};
pub use error::{CodecError, StreamError};
pub use facade::StreamFacade;
pub use frame::{Frame, FrameKind, FrameSink, SharedSink};
pub use metrics::{FrameRateMeter, MuxMetricsSnapshot};
pub use multiplexer::{ConnectionState, MuxStatus, StreamMultiplexer};
pub use source::{ChannelSource, StaticChannelSource};
pub use status::{SessionState, SessionStatus};
pub use transport::{Connector, UpstreamEvent, UpstreamLink, WsConnector};
