//! EventEmitter (component I) — an in-process publish bus with named
//! topics. Synchronous subscribers are invoked inline from the emitting
//! thread; asynchronous subscribers are fed through a bounded queue and
//! dropped on overflow (spec.md §4.I, §5).

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The fixed set of topics the admission pipeline publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ToolReserved,
    ToolSettled,
    ToolFailed,
    ReservationExpired,
    RateDenied,
}

impl Topic {
    fn as_str(&self) -> &'static str {
        match self {
            Topic::ToolReserved => "tool.reserved",
            Topic::ToolSettled => "tool.settled",
            Topic::ToolFailed => "tool.failed",
            Topic::ReservationExpired => "reservation.expired",
            Topic::RateDenied => "rate.denied",
        }
    }
}

/// A published event payload. Cheap to clone (an `Arc` around the data).
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Topic,
    pub key: String,
    pub tool: Option<String>,
    pub amount: Option<f64>,
    pub reason: Option<String>,
}

const ASYNC_QUEUE_CAPACITY: usize = 1024;

enum Subscriber {
    Sync(Arc<dyn Fn(&Event) + Send + Sync>),
    Async(mpsc::Sender<Event>),
}

/// Handle returned by `subscribe_async` so the caller can drain delivered
/// events from its own task.
pub struct AsyncSubscription {
    pub receiver: mpsc::Receiver<Event>,
}

/// Per-topic subscriber fan-out. Each topic has its own lock (here, its
/// own DashMap bucket) so fan-out on one topic never contends with
/// another, per spec.md §5's "per-topic lock" discipline.
pub struct EventEmitter {
    subscribers: DashMap<&'static str, Vec<Subscriber>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Register a synchronous subscriber: invoked inline on the emitting
    /// thread, in registration order, while the per-topic lock is held
    /// only long enough to clone the subscriber list (fan-out itself
    /// happens without holding the topic lock, per spec.md §5).
    pub fn subscribe<F>(&self, topic: Topic, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .entry(topic.as_str())
            .or_default()
            .push(Subscriber::Sync(Arc::new(callback)));
    }

    /// Register an asynchronous subscriber backed by a bounded queue.
    /// When the queue is full, new events for this subscriber are
    /// dropped (spec.md §4.I back-pressure policy) rather than blocking
    /// the emitting thread.
    pub fn subscribe_async(&self, topic: Topic) -> AsyncSubscription {
        let (tx, rx) = mpsc::channel(ASYNC_QUEUE_CAPACITY);
        self.subscribers
            .entry(topic.as_str())
            .or_default()
            .push(Subscriber::Async(tx));
        AsyncSubscription { receiver: rx }
    }

    /// Publish an event to every subscriber of its topic.
    pub fn emit(&self, event: Event) {
        let topic = event.topic.as_str();
        // Clone the subscriber handles while holding the topic lock only
        // momentarily, then fan out without holding it.
        let subs: Vec<_> = match self.subscribers.get(topic) {
            Some(entry) => entry
                .iter()
                .map(|s| match s {
                    Subscriber::Sync(f) => SubscriberHandle::Sync(f.clone()),
                    Subscriber::Async(tx) => SubscriberHandle::Async(tx.clone()),
                })
                .collect(),
            None => return,
        };

        for sub in subs {
            match sub {
                SubscriberHandle::Sync(f) => f(&event),
                SubscriberHandle::Async(tx) => {
                    // drop-on-full: try_send never blocks the emitting thread.
                    if tx.try_send(event.clone()).is_err() {
                        metrics::counter!("creditgate_events_dropped_total", "topic" => topic)
                            .increment(1);
                    }
                }
            }
        }
    }
}

enum SubscriberHandle {
    Sync(Arc<dyn Fn(&Event) + Send + Sync>),
    Async(mpsc::Sender<Event>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(topic: Topic) -> Event {
        Event {
            topic,
            key: "k1".to_string(),
            tool: Some("search".to_string()),
            amount: Some(10.0),
            reason: None,
        }
    }

    #[test]
    fn sync_subscriber_is_invoked() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        emitter.subscribe(Topic::ToolSettled, move |_e| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(event(Topic::ToolSettled));
        emitter.emit(event(Topic::ToolSettled));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unrelated_topic_not_invoked() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        emitter.subscribe(Topic::ToolSettled, move |_e| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(event(Topic::ToolFailed));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_subscriber_receives_events() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.subscribe_async(Topic::RateDenied);
        emitter.emit(event(Topic::RateDenied));
        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.key, "k1");
    }

    #[tokio::test]
    async fn async_subscriber_drops_on_full_queue() {
        let emitter = EventEmitter::new();
        let _sub = emitter.subscribe_async(Topic::ReservationExpired);
        // Flood well past the bounded capacity; none of this should block
        // or panic even though nothing is draining the receiver.
        for _ in 0..(ASYNC_QUEUE_CAPACITY + 50) {
            emitter.emit(event(Topic::ReservationExpired));
        }
    }
}
