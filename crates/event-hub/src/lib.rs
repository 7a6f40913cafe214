//! Topic-based fan-out of execution events to connected channels.
//!
//! A channel is one connected observer (typically a WebSocket). Topics are
//! execution ids; a channel receives every event published on the topics it
//! subscribed to, plus broadcasts and heartbeat pings.

mod event;
mod hub;

pub use event::{EventKind, ExecutionEvent};
pub use hub::{ChannelId, DEFAULT_CHANNEL_CAPACITY, Hub, Outbound};
