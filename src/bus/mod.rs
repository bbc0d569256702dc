//! Event Bus Module
//!
//! Single-process publish/subscribe channel carrying canonical inbound
//! envelopes from providers to consumers (persistence, outgoing-webhook
//! delivery, automation).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Provider   │────>│   EventBus  │────>│ Subscriber 1 │
//! │ (Telegram)  │     │ (broadcast) │     │ (persistence)│
//! └─────────────┘     └──────┬──────┘     └──────────────┘
//!                            │
//!                            ▼
//!                     ┌──────────────┐
//!                     │ Subscriber N │
//!                     │  (webhooks)  │
//!                     └──────────────┘
//! ```
//!
//! `publish` is fire-and-forget: it never blocks on subscriber completion
//! and a failing subscriber neither rolls back the publish nor affects the
//! other subscribers. Every subscriber receives every published envelope in
//! publish order.
//!
//! # Example
//!
//! ```
//! use omnigate::bus::{CanonicalEnvelope, EventBus};
//! use omnigate::connection::{ConnectionRef, Platform};
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! let env = CanonicalEnvelope::new(
//!     Platform::Telegram,
//!     ConnectionRef::new("proj", "conn"),
//!     "chat456",
//!     "user123",
//!     "Hello",
//! );
//! bus.publish(env);
//!
//! let received = rx.recv().await.unwrap();
//! assert_eq!(received.text, "Hello");
//! # })
//! ```

mod dedup;
mod envelope;

pub use dedup::DedupCache;
pub use envelope::{CanonicalEnvelope, Direction, MediaAttachment, MediaType};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default buffer size for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// The event bus carrying canonical envelopes to all subscribers.
///
/// Backed by a typed `tokio::sync::broadcast` channel with an explicit
/// subscriber list managed by the channel itself: each [`EventBus::subscribe`]
/// call creates an independent receiver that observes every envelope
/// published after the call.
pub struct EventBus {
    tx: broadcast::Sender<CanonicalEnvelope>,
}

impl EventBus {
    /// Creates a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus with a custom buffer capacity.
    ///
    /// A subscriber that falls more than `capacity` envelopes behind
    /// observes a lag gap rather than blocking publishers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an envelope to all current subscribers.
    ///
    /// Fire-and-forget: returns the number of subscribers the envelope was
    /// delivered to. Zero subscribers is not an error — the envelope is
    /// dropped with a trace log.
    pub fn publish(&self, envelope: CanonicalEnvelope) -> usize {
        match self.tx.send(envelope) {
            Ok(n) => n,
            Err(_) => {
                trace!("event bus publish with no subscribers; envelope dropped");
                0
            }
        }
    }

    /// Registers a new subscriber and returns its typed receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<CanonicalEnvelope> {
        self.tx.subscribe()
    }

    /// Registers a handler-style subscriber running on its own task.
    ///
    /// The task ends when the bus is dropped. A handler panicking kills only
    /// its own task; other subscribers are unaffected.
    pub fn subscribe_with<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(CanonicalEnvelope) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => handler(envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("event bus subscriber lagged, skipped {} envelopes", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    /// Clones the bus handle, sharing the same underlying channel.
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionRef, Platform};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn envelope(text: &str) -> CanonicalEnvelope {
        CanonicalEnvelope::new(
            Platform::Telegram,
            ConnectionRef::new("proj", "conn"),
            "chat",
            "user",
            text,
        )
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(envelope("nobody listening")), 0);
    }

    #[tokio::test]
    async fn test_single_subscriber_receives() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(envelope("hello")), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.text, "hello");
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_envelope() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(envelope("first"));
        bus.publish(envelope("second"));

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().text, "first");
            assert_eq!(rx.recv().await.unwrap().text, "second");
        }
    }

    #[tokio::test]
    async fn test_publish_order_preserved_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(envelope(&format!("msg {}", i)));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().text, format!("msg {}", i));
        }
    }

    #[tokio::test]
    async fn test_subscribe_with_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let handle = bus.subscribe_with(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(envelope("a"));
        bus.publish(envelope("b"));

        // Give the handler task time to drain.
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn test_cloned_bus_shares_channel() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();
        let mut rx = bus1.subscribe();

        bus2.publish(envelope("via clone"));
        assert_eq!(rx.recv().await.unwrap().text, "via clone");
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
