//! Session event types and the bus they are published on.

pub mod base_event;
pub mod event_bus;

pub use base_event::{ApiCallEvent, EventMeta, ShellEvent};
pub use event_bus::EventBus;
