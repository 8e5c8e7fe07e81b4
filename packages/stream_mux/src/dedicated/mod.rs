//! Dedicated stream client: one consumer, one socket, its own reconnect
//! state machine.

mod backoff;
mod client;

pub use backoff::Backoff;
pub use client::{DedicatedClient, DedicatedOptions};
