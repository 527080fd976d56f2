//! In-process pub/sub fan-out for [`HiveEvent`]s.
//!
//! Each subscriber gets its own bounded queue. Publishing never blocks the
//! hot path: a subscriber whose queue is full is dropped on the spot, which
//! closes its channel; observing end-of-stream is the signal to reconnect.
//! The stream is not persistent across restarts.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use apiary_core::HiveEvent;
use futures::Stream;
use tokio::sync::mpsc;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// A subscription handle. Yields events in publication order until the
/// subscriber falls too far behind, at which point the stream ends.
pub struct EventStream {
    rx: mpsc::Receiver<HiveEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<HiveEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = HiveEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<HiveEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        EventStream { rx }
    }

    /// Deliver an event to every live subscriber; order is the publication
    /// order because delivery happens under one lock.
    pub fn publish(&self, event: HiveEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(topic = event.topic(), "dropping slow event subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_publication_order() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();

        bus.publish(HiveEvent::SwarmUpdated);
        bus.publish(HiveEvent::MailFailed {
            mail_id: None,
            reason: "x".to_string(),
        });

        match stream.recv().await {
            Some(HiveEvent::SwarmUpdated) => {}
            other => panic!("expected SwarmUpdated, got {other:?}"),
        }
        match stream.recv().await {
            Some(HiveEvent::MailFailed { .. }) => {}
            other => panic!("expected MailFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe();

        for _ in 0..3 {
            bus.publish(HiveEvent::SwarmUpdated);
        }
        assert_eq!(bus.subscriber_count(), 0);

        // The queued events drain, then the closed channel ends the stream.
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::default();
        let stream = bus.subscribe();
        drop(stream);
        bus.publish(HiveEvent::SwarmUpdated);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(HiveEvent::SwarmUpdated);
        assert!(matches!(a.recv().await, Some(HiveEvent::SwarmUpdated)));
        assert!(matches!(b.recv().await, Some(HiveEvent::SwarmUpdated)));
    }
}
