//! Thread-safe pub/sub for server events.
//!
//! Built on `tokio::sync::broadcast`: publishing is a non-blocking
//! channel send (safe even from inside a delivery context), fan-out is
//! per subscriber, and a subscriber that cannot keep up loses the oldest
//! events and has its `dropped` counter incremented instead of blocking
//! the publisher.
//!
//! Sequence numbers are assigned at publish time from one atomic, so
//! every subscriber observes events in monotonic sequence order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cardlink_types::event::{Event, SequencedEvent};
use tokio::sync::broadcast;

use crate::metrics::METRICS_ID_EVENTS_DROPPED;

/// Fan-out bus for [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SequencedEvent>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a bus whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Never blocks; a bus without subscribers swallows the event.
    pub fn publish(&self, event: Event) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(seq, "publishing {event:?}");
        // send only fails when there is no receiver, which is fine
        let _ = self.tx.send(SequencedEvent { seq, event });
    }

    /// Subscribes to every event published from now on.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            predicate: None,
            dropped: 0,
            bus_dropped: Arc::clone(&self.dropped),
        }
    }

    /// Subscribes with a predicate; non-matching events are skipped
    /// (they still count against the subscriber's buffer).
    pub fn subscribe_filtered(
        &self,
        predicate: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            predicate: Some(Box::new(predicate)),
            dropped: 0,
            bus_dropped: Arc::clone(&self.dropped),
        }
    }

    /// Events dropped across all subscribers since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Gives subscribers up to `deadline` to drain before the bus goes
    /// away. Best effort; dashboards holding a stream open simply stop
    /// receiving afterwards.
    pub async fn flush(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            while !self.tx.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
    }
}

type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// One subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<SequencedEvent>,
    predicate: Option<Predicate>,
    dropped: u64,
    bus_dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Receives the next matching event.
    ///
    /// Returns `None` once the bus is gone and the buffer is drained.
    /// Lagging is not an error: the skipped events are added to
    /// [`EventStream::dropped_count`] and delivery continues with the
    /// oldest retained event.
    pub async fn recv(&mut self) -> Option<SequencedEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.predicate.as_ref().is_none_or(|p| p(&event.event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    self.bus_dropped.fetch_add(n, Ordering::Relaxed);
                    ::metrics::counter!(METRICS_ID_EVENTS_DROPPED).increment(n);
                    tracing::warn!("event subscriber lagged, dropped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost to lag.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardlink_types::SessionId;

    fn session_event(id: SessionId) -> Event {
        Event::ApduSent {
            session_id: id,
            apdu_hex: "00A40400".to_owned(),
        }
    }

    #[tokio::test]
    async fn delivers_in_sequence_order() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();
        let id = SessionId::new();
        for _ in 0..5 {
            bus.publish(session_event(id));
        }
        let mut last = None;
        for _ in 0..5 {
            let event = stream.recv().await.expect("delivered");
            if let Some(prev) = last {
                assert!(event.seq > prev);
            }
            last = Some(event.seq);
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_and_counts() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();
        let id = SessionId::new();
        for _ in 0..10 {
            bus.publish(session_event(id));
        }
        // the oldest retained event is seq 6: 10 published, 4 buffered
        let first = stream.recv().await.expect("delivered");
        assert_eq!(first.seq, 6);
        assert_eq!(stream.dropped_count(), 6);
        assert_eq!(bus.dropped(), 6);
    }

    #[tokio::test]
    async fn predicate_filters_events() {
        let bus = EventBus::new(16);
        let wanted = SessionId::new();
        let other = SessionId::new();
        let mut stream = bus.subscribe_filtered(move |event| {
            matches!(event, Event::ApduSent { session_id, .. } if *session_id == wanted)
        });
        bus.publish(session_event(other));
        bus.publish(session_event(wanted));
        let event = stream.recv().await.expect("delivered");
        assert!(matches!(
            event.event,
            Event::ApduSent { session_id, .. } if session_id == wanted
        ));
    }

    #[tokio::test]
    async fn closes_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();
        bus.publish(session_event(SessionId::new()));
        drop(bus);
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }
}
