//! # Fan-out Channel
//!
//! A subscriber list of bounded channels. Each emit delivers a clone of the
//! value to every live subscriber, waiting at most `send_timeout` per
//! subscriber so one stalled consumer cannot wedge the producer.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::warn;

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Default time an emit waits on a full subscriber.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Broadcasts values to any number of bounded subscribers.
pub struct PubSub<T> {
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
    capacity: usize,
    send_timeout: Duration,
}

impl<T: Clone + Send + 'static> Default for PubSub<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY, DEFAULT_SEND_TIMEOUT)
    }
}

impl<T: Clone + Send + 'static> PubSub<T> {
    #[must_use]
    pub fn new(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            send_timeout,
        }
    }

    /// Register a new subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Number of subscribers that have not been pruned yet.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `value` to every subscriber.
    ///
    /// A subscriber that stays full past the send timeout misses this value.
    /// Subscribers whose receiver was dropped are removed.
    pub async fn emit(&self, value: T) {
        // Snapshot so the lock is never held across an await
        let senders: Vec<mpsc::Sender<T>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut saw_closed = false;
        for sender in &senders {
            match sender.send_timeout(value.clone(), self.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!("Subscriber did not accept value within {:?}, dropping it", self.send_timeout);
                }
                Err(SendTimeoutError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| !s.is_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let pubsub: PubSub<u32> = PubSub::default();
        let mut a = pubsub.subscribe();
        let mut b = pubsub.subscribe();

        pubsub.emit(7).await;

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let pubsub: PubSub<u32> = PubSub::default();
        let mut kept = pubsub.subscribe();
        let dropped = pubsub.subscribe();
        drop(dropped);

        assert_eq!(pubsub.subscriber_count(), 2);
        pubsub.emit(1).await;
        assert_eq!(pubsub.subscriber_count(), 1);
        assert_eq!(kept.recv().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_subscriber_does_not_block_others() {
        let pubsub: PubSub<u32> = PubSub::new(1, Duration::from_millis(50));
        let _stalled = pubsub.subscribe();
        let mut live = pubsub.subscribe();

        pubsub.emit(1).await;
        assert_eq!(live.recv().await, Some(1));

        // Stalled subscriber is full now; the emit must still complete
        pubsub.emit(2).await;
        assert_eq!(live.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let pubsub: PubSub<String> = PubSub::default();
        pubsub.emit("nobody listens".to_string()).await;
        assert_eq!(pubsub.subscriber_count(), 0);
    }
}
