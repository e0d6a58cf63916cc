//! Fan-out of accepted readings to live subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a subscriber
//! whose queue is full (or whose receiver is gone) is dropped from the registry
//! and the rest still receive the event.

use crate::store::Reading;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 64;

/// The payload pushed to websocket clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingEvent {
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&Reading> for ReadingEvent {
    fn from(reading: &Reading) -> Self {
        Self {
            metric: reading.metric.clone(),
            value: reading.value,
            timestamp: reading.timestamp,
        }
    }
}

type Registry<T> = Mutex<HashMap<Uuid, mpsc::Sender<T>>>;

fn lock<T>(registry: &Registry<T>) -> MutexGuard<'_, HashMap<Uuid, mpsc::Sender<T>>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BroadcastHub<T> {
    subscribers: Arc<Registry<T>>,
    queue: usize,
}

impl<T> Clone for BroadcastHub<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
            queue: self.queue,
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastHub<T> {
    pub fn new(queue: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            queue: queue.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscriber<T> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue);
        lock(&self.subscribers).insert(id, tx);
        tracing::debug!(subscriber = %id, "subscriber registered");
        Subscriber {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Unregisters `subscriber`. A subscriber the hub already dropped is a no-op.
    pub fn unsubscribe(&self, subscriber: Subscriber<T>) {
        let id = subscriber.id;
        drop(subscriber);
        tracing::debug!(subscriber = %id, "subscriber removed");
    }

    /// Delivers `event` to every registered subscriber and returns how many
    /// received it.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<(Uuid, mpsc::Sender<T>)> = lock(&self.subscribers)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = %id, "subscriber queue full; dropping subscriber");
                    failed.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => failed.push(id),
            }
        }

        if !failed.is_empty() {
            let mut subscribers = lock(&self.subscribers);
            for id in failed {
                subscribers.remove(&id);
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Receiving end of a subscription. Dropping it unregisters the subscriber.
pub struct Subscriber<T> {
    id: Uuid,
    rx: mpsc::Receiver<T>,
    registry: Weak<Registry<T>>,
}

impl<T> Subscriber<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_in_order() {
        let hub = BroadcastHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.publish(&1u32), 2);
        assert_eq!(hub.publish(&2u32), 2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_block_others() {
        let hub = BroadcastHub::new(8);
        let mut healthy = hub.subscribe();
        let mut broken = hub.subscribe();
        broken.rx.close();

        assert_eq!(hub.publish(&"r1"), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(healthy.recv().await, Some("r1"));
    }

    #[tokio::test]
    async fn closed_middle_subscriber_is_removed_and_neighbours_still_receive() {
        let hub = BroadcastHub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        let mut third = hub.subscribe();
        second.rx.close();

        assert_eq!(hub.publish(&"r"), 2);
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(first.recv().await, Some("r"));
        assert_eq!(third.recv().await, Some("r"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribe_and_drop_race_with_publish() {
        const EVENTS: u32 = 200;
        let hub: BroadcastHub<u32> = BroadcastHub::new(EVENTS as usize + 1);
        let mut watcher = hub.subscribe();

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for n in 0..EVENTS {
                    hub.publish(&n);
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut kept = Vec::new();
        for i in 0..500 {
            let subscriber = hub.subscribe();
            if i % 10 == 0 {
                kept.push(subscriber);
            } else if i % 2 == 0 {
                hub.unsubscribe(subscriber);
            }
            tokio::task::yield_now().await;
        }
        publisher.await.expect("publisher");

        assert_eq!(hub.subscriber_count(), kept.len() + 1);

        let drain = |subscriber: &mut Subscriber<u32>| {
            let mut seen = Vec::new();
            while let Ok(n) = subscriber.rx.try_recv() {
                seen.push(n);
            }
            seen
        };
        assert_eq!(drain(&mut watcher), (0..EVENTS).collect::<Vec<_>>());

        // Late subscribers see an unbroken suffix of the stream.
        for mut subscriber in kept {
            let seen = drain(&mut subscriber);
            if let Some(&first) = seen.first() {
                assert_eq!(seen, (first..EVENTS).collect::<Vec<_>>());
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_when_queue_fills() {
        let hub = BroadcastHub::new(1);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        assert_eq!(hub.publish(&1u8), 2);
        assert_eq!(fast.recv().await, Some(1));
        assert_eq!(hub.publish(&2u8), 1);
        assert_eq!(fast.recv().await, Some(2));

        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(slow.recv().await, Some(1));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn drop_and_unsubscribe_remove_registration() {
        let hub: BroadcastHub<u8> = BroadcastHub::new(4);
        let first = hub.subscribe();
        let second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(first);
        assert_eq!(hub.subscriber_count(), 1);

        hub.unsubscribe(second);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(&9), 0);
    }
}
