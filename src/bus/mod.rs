//! Event fan-out for one agent instance.
//!
//! Every subscriber observes the same ordered event sequence (broadcast,
//! not competing consumption). The loop publishes through a sink; slow
//! subscribers that fall more than `capacity` events behind observe a
//! `Lagged` gap rather than blocking the loop.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::agent_loop::{AgentEvent, EventSink};

/// Broadcast bus carrying the canonical event sequence.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`.
    pub fn subscribe_stream(&self) -> BroadcastStream<AgentEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Publish one event. Delivery requires no subscribers; events published
    /// to an empty bus are dropped.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    /// A sink handing loop events to this bus, for [`crate::agent_loop::RunRequest`].
    pub fn sink(&self) -> EventSink {
        let tx = self.tx.clone();
        Arc::new(move |event: AgentEvent| {
            let _ = tx.send(event);
        })
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(event: &AgentEvent) -> &'static str {
        event.kind()
    }

    #[tokio::test]
    async fn all_subscribers_observe_the_same_sequence() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(AgentEvent::AgentStart);
        bus.publish(AgentEvent::TurnStart);
        bus.publish(AgentEvent::AgentEnd {
            messages: Vec::new(),
        });

        for rx in [&mut first, &mut second] {
            let mut kinds = Vec::new();
            for _ in 0..3 {
                kinds.push(kind(&rx.recv().await.expect("recv")));
            }
            assert_eq!(kinds, vec!["agent_start", "turn_start", "agent_end"]);
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_error() {
        let bus = EventBus::new(4);
        bus.publish(AgentEvent::AgentStart);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn sink_feeds_the_bus() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let sink = bus.sink();
        sink(AgentEvent::TurnStart);
        assert_eq!(kind(&rx.recv().await.expect("recv")), "turn_start");
    }
}
