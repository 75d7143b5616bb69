//! Topic-based fan-out to live subscribers.
//!
//! Each [`Topic`] gets its own tokio broadcast channel, so publishing is one
//! O(1) send no matter how many subscribers there are. Delivery is
//! best-effort: a subscriber that falls more than `capacity` events behind
//! skips ahead and must reconcile through the operation log's replay.

use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::presence::PresenceEvent;
use crate::storage::OperationRecord;
use crate::topic::Topic;

/// Something a subscriber can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// An operation was committed to the log.
    Operation(OperationRecord),
    Presence(PresenceEvent),
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_published: u64,
    /// Events published to a topic nobody was subscribed to.
    pub events_unobserved: u64,
    /// Events skipped by lagging subscribers.
    pub events_dropped: u64,
    pub active_topics: usize,
}

/// Lock-free counters on the publish path.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_published: AtomicU64,
    events_unobserved: AtomicU64,
    events_dropped: AtomicU64,
}

/// Topic → channel registry.
pub struct Broadcaster {
    topics: Arc<RwLock<HashMap<Topic, broadcast::Sender<Arc<Event>>>>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl Broadcaster {
    /// `capacity` is the number of events buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Publish `event` to every current subscriber of `topic`. Returns the
    /// number of subscribers it was queued for.
    pub async fn publish(&self, topic: Topic, event: Event) -> usize {
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        let delivered = {
            let topics = self.topics.read().await;
            topics
                .get(&topic)
                .and_then(|sender| sender.send(Arc::new(event)).ok())
                .unwrap_or(0)
        };
        if delivered == 0 {
            self.stats.events_unobserved.fetch_add(1, Ordering::Relaxed);
        }
        log::trace!("Published to {topic}: {delivered} subscribers");
        delivered
    }

    /// Subscribe to `topic`, creating its channel on first use.
    pub async fn subscribe(&self, topic: Topic) -> Subscription {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(&topic) {
                return self.subscription(topic, sender);
            }
        }

        // Slow path: write lock, double-checked
        let mut topics = self.topics.write().await;
        let sender = topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        self.subscription(topic, sender)
    }

    fn subscription(&self, topic: Topic, sender: &broadcast::Sender<Arc<Event>>) -> Subscription {
        Subscription {
            topic,
            rx: sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .await
            .get(&topic)
            .map_or(0, |s| s.receiver_count())
    }

    /// Drop channels that no longer have subscribers.
    pub async fn remove_idle(&self) -> usize {
        let mut topics = self.topics.write().await;
        let before = topics.len();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        before - topics.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_unobserved: self.stats.events_unobserved.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            active_topics: self.topic_count().await,
        }
    }
}

/// A live subscription to one topic.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Arc<Event>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event, or `None` once the topic is gone. Lag is logged and
    /// skipped over.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.stats.events_dropped.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!(
                        "Subscriber on {} lagged, skipped {skipped} events; replay required",
                        self.topic
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.stats.events_dropped.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}
