//! Topic-keyed publish/subscribe fan-out.
//!
//! Channels are created lazily on first subscription and publishing is
//! best-effort: no subscriber, no delivery, never an error. Events from a
//! single publisher arrive in publication order at each subscriber
//! (broadcast channel semantics); publishers on different actors are not
//! ordered with respect to one another.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use redlab_domain::{Event, Topic};

const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a topic. A slow subscriber that falls more than the
    /// channel capacity behind loses the oldest events (at-most-once).
    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Event> {
        let key = topic.key();
        let mut channels = self.channels.write();
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event under a topic. Best-effort: silently dropped when
    /// the topic has no subscribers.
    pub fn publish(&self, topic: &Topic, event: Event) {
        let key = topic.key();
        let sender = self.channels.read().get(&key).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    /// Number of live subscribers on a topic (introspection).
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.channels
            .read()
            .get(&topic.key())
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}
