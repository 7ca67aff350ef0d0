//! redub-events: the live event plane.
//!
//! Publishers (scheduler, workers, dispatch) push events for a job topic or
//! the global topic; subscribers (SSE and WebSocket adapters) consume them
//! through bounded per-subscriber channels. Publishers never block: a slow
//! subscriber overflows its own buffer, loses the newest events, receives a
//! `drop_notice`, and is eventually disconnected.

pub mod event;
pub mod hub;

pub use event::{JobEvent, SequencedEvent};
pub use hub::{EventHub, HubConfig, Subscription, Topic};
