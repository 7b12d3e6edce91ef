//! Event bus — broadcast fan-out with per-subscriber bounded buffers.
//!
//! The producer (the agent loop) never blocks on a subscriber. A subscriber
//! that falls more than the buffer capacity behind loses the oldest events
//! and sees a synthetic `Error { kind: SubscriberLagged }` on its own stream
//! before resuming from the oldest retained event.

use crate::types::{AgentEvent, ErrorKind};
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers. Never blocks; with no
    /// subscribers the event is dropped.
    pub fn publish(&self, event: AgentEvent) {
        trace!(?event, "bus publish");
        let _ = self.tx.send(event);
    }

    /// Register a subscriber. Dropping the returned handle unsubscribes.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A subscription handle. Each subscriber owns its buffer; events are
/// immutable values shared across subscribers.
pub struct EventSubscriber {
    rx: broadcast::Receiver<AgentEvent>,
}

impl EventSubscriber {
    /// Receive the next event. Returns `None` once the bus is dropped and
    /// the buffer is drained. A lagged subscriber receives one synthetic
    /// `SubscriberLagged` error in place of the dropped prefix.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(AgentEvent::Error {
                kind: ErrorKind::SubscriberLagged,
                message: format!("subscriber lagged, {} events dropped", missed),
            }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant, for draining in tests.
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Some(AgentEvent::Error {
                kind: ErrorKind::SubscriberLagged,
                message: format!("subscriber lagged, {} events dropped", missed),
            }),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(n: usize) -> AgentEvent {
        AgentEvent::Error {
            kind: ErrorKind::ToolExecution,
            message: format!("event-{}", n),
        }
    }

    #[tokio::test]
    async fn fan_out_delivers_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(AgentEvent::TurnStarted);

        assert!(matches!(a.recv().await, Some(AgentEvent::TurnStarted)));
        assert!(matches!(b.recv().await, Some(AgentEvent::TurnStarted)));
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag_marker_then_resumes() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();

        for n in 0..10 {
            bus.publish(text_event(n));
        }

        let first = sub.recv().await;
        assert!(matches!(
            first,
            Some(AgentEvent::Error {
                kind: ErrorKind::SubscriberLagged,
                ..
            })
        ));

        // The stream resumes as a suffix of the produced sequence.
        let mut seen = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let AgentEvent::Error { message, .. } = event {
                seen.push(message);
            }
        }
        assert_eq!(seen.last().map(String::as_str), Some("event-9"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bus = EventBus::new(2);
        for n in 0..100 {
            bus.publish(text_event(n));
        }
    }
}
