// =============================================================================
// Event Bus — in-process pub/sub with exact unsubscribe
// =============================================================================
//
// Topics are plain strings. Subscribers receive events on an unbounded
// channel so publication never blocks the publishing tick; handlers that
// need to do I/O run on their own task draining the receiver.
//
// Subscription ids are UUIDs so unsubscribe is exact; delivery within one
// topic follows registration order. A trailing `*` subscribes to a topic
// prefix (used for the delegated `pool-crawler.*` family).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Topic carrying instance status + snapshot updates.
pub const TOPIC_STRATEGY_STATUS: &str = "strategy.status.update";
/// Topic carrying smart-stop-loss progress updates.
pub const TOPIC_SMART_STOP_LOSS: &str = "strategy.smart-stop-loss.update";
/// Prefix for pool-crawler traffic, forwarded opaque to the broadcaster.
pub const TOPIC_POOL_CRAWLER_PREFIX: &str = "pool-crawler.";

/// One published event.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: serde_json::Value,
    /// Milliseconds since epoch at publish time.
    pub timestamp: i64,
}

struct Subscriber {
    id: Uuid,
    /// Pattern the subscriber registered with (exact topic or `prefix.*`).
    pattern: String,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// Process-wide event bus. Cheap to clone; all clones share the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `pattern` (exact topic, or `prefix.*`).
    /// Returns the subscription id and the receiving end of the channel.
    pub fn subscribe(&self, pattern: &str) -> (Uuid, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.write().push(Subscriber {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        debug!(%id, pattern, "event bus subscription registered");
        (id, rx)
    }

    /// Remove exactly one subscription. Returns whether it existed; a missed
    /// unsubscribe is a leak, so callers should treat `false` as a bug.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() < before;
        if removed {
            debug!(%id, "event bus subscription released");
        } else {
            warn!(%id, "unsubscribe for unknown subscription id");
        }
        removed
    }

    /// Publish `payload` on `topic`. Delivery order within one topic follows
    /// registration order. Dead receivers are pruned lazily.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = BusEvent {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        };

        let mut dead: Vec<Uuid> = Vec::new();
        {
            let subs = self.subscribers.read();
            for sub in subs.iter().filter(|s| pattern_matches(&s.pattern, topic)) {
                if sub.tx.send(event.clone()).is_err() {
                    dead.push(sub.id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write();
            subs.retain(|s| !dead.contains(&s.id));
            debug!(count = dead.len(), topic, "pruned dead subscribers");
        }
    }

    /// Number of live subscriptions (used by the health checker to spot
    /// subscription leaks).
    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

fn pattern_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topic_delivery() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(TOPIC_STRATEGY_STATUS);

        bus.publish(TOPIC_STRATEGY_STATUS, serde_json::json!({"x": 1}));
        bus.publish("other.topic", serde_json::json!({"x": 2}));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.topic, TOPIC_STRATEGY_STATUS);
        assert_eq!(ev.payload["x"], 1);
        assert!(rx.try_recv().is_err(), "unrelated topic must not deliver");
    }

    #[test]
    fn prefix_pattern_matches_family() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe("pool-crawler.*");

        bus.publish("pool-crawler.discovered", serde_json::json!({}));
        bus.publish("pool-crawler.command", serde_json::json!({}));
        bus.publish("strategy.status.update", serde_json::json!({}));

        assert_eq!(rx.try_recv().unwrap().topic, "pool-crawler.discovered");
        assert_eq!(rx.try_recv().unwrap().topic, "pool-crawler.command");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_is_exact() {
        let bus = EventBus::new();
        let (id_a, mut rx_a) = bus.subscribe("t");
        let (_id_b, mut rx_b) = bus.subscribe("t");

        assert!(bus.unsubscribe(id_a));
        assert!(!bus.unsubscribe(id_a), "second unsubscribe must report miss");

        bus.publish("t", serde_json::json!(1));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(bus.subscription_count(), 1);
    }

    #[test]
    fn delivery_follows_registration_order() {
        let bus = EventBus::new();
        let (_a, mut rx_a) = bus.subscribe("t");
        let (_b, mut rx_b) = bus.subscribe("t");

        bus.publish("t", serde_json::json!("first"));

        // Both received the same event; ordering is observable through the
        // registration list, which `publish` walks front to back.
        assert_eq!(rx_a.try_recv().unwrap().payload, "first");
        assert_eq!(rx_b.try_recv().unwrap().payload, "first");
    }

    #[test]
    fn dead_receivers_are_pruned() {
        let bus = EventBus::new();
        let (_a, rx) = bus.subscribe("t");
        drop(rx);
        bus.publish("t", serde_json::json!(0));
        assert_eq!(bus.subscription_count(), 0);
    }
}
