use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, trace};
use wcs_core::SessionEvent;

/// Receives the typed events produced by a connection controller.
///
/// Emission is synchronous so the controller never waits on a consumer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SessionEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

#[derive(Clone, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, event: &SessionEvent) {
        debug!(
            target: "webchat.sink",
            event = event.name(),
            "dropping event (noop sink)"
        );
    }
}

/// Fans events out to any number of `tokio::sync::broadcast` subscribers.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &SessionEvent) {
        if self.tx.send(event.clone()).is_err() {
            trace!(event = event.name(), "no subscribers for session event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcs_core::SessionStatus;

    #[test]
    fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        sink.emit(&SessionEvent::status(SessionStatus::Connecting));

        assert_eq!(first.try_recv().unwrap().name(), "connectionStatus");
        assert_eq!(second.try_recv().unwrap().name(), "connectionStatus");
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        BroadcastSink::default().emit(&SessionEvent::TokenExpired);
        NoopSink.emit(&SessionEvent::TokenExpired);
    }
}
