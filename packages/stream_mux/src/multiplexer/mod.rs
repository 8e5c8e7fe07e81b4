//! Shared-connection multiplexer.
//!
//! One upstream socket serves every subscriber. The active channel is
//! time-sliced across the distinct requested channels and each frame is
//! routed by its label once the label has been seen consistently.

mod actor;
mod state;

pub use actor::{ConnectionState, MuxStatus, StreamMultiplexer};
pub use state::{MuxState, RouteOutcome, Routed, SwitchEvent};
