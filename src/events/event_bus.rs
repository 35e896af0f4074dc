//! Fan-out bus for session events.
//!
//! Publishing never blocks and never fails the publisher: with no
//! subscribers the event is dropped, and a slow subscriber loses its oldest
//! events instead of stalling the call that emitted them.

use tokio::sync::broadcast;

use super::base_event::ShellEvent;

/// Default number of events retained per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast bus owned by one session.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ShellEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber.
    pub fn emit(&self, event: ShellEvent) {
        if self.sender.send(event).is_err() {
            log::trace!("event dropped: no subscribers");
        }
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every event currently queued on `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<ShellEvent>) -> Vec<ShellEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                log::warn!("event subscriber lagged, {} events skipped", skipped);
            }
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(ShellEvent::warning("nobody listens"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(ShellEvent::warning("a"));
        bus.emit(ShellEvent::warning("b"));
        let events = drain(&mut rx);
        let messages: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ShellEvent::Warning { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn test_slow_subscriber_does_not_block() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.emit(ShellEvent::warning(format!("w{i}")));
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
    }
}
