//! Event bus port
//!
//! Telemetry, session and command events go out on the bus; command
//! requests and cross-node session control come back in. The concrete
//! broker lives outside this crate; [`EventBus`] is the contract it
//! implements. Messages within one partition key are ordered.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// One message as seen by a consumer
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(String),
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
    #[error("bus circuit open")]
    CircuitOpen,
}

/// Port to the durable event bus.
///
/// `group` gives competing-consumer semantics: each message on a topic is
/// delivered to one member per distinct group.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: String)
        -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str, group: &str)
        -> Result<mpsc::Receiver<BusMessage>, BusError>;
}

// ── In-memory implementation ───────────────────────────────────

const CHANNEL_CAPACITY: usize = 256;

struct GroupSubscribers {
    group: String,
    senders: Vec<mpsc::Sender<BusMessage>>,
    next: AtomicUsize,
}

/// In-memory [`EventBus`] used by tests and single-node runs.
///
/// Delivery is round-robin within a group, fan-out across groups, which
/// mirrors the competing-consumer semantics of the production broker.
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: DashMap<String, Vec<GroupSubscribers>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: String,
    ) -> Result<(), BusError> {
        let message = BusMessage {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload,
        };

        // Collect one live sender per group, then send outside the map lock.
        let targets: Vec<mpsc::Sender<BusMessage>> = match self.topics.get(topic) {
            Some(groups) => groups
                .iter()
                .filter_map(|g| {
                    if g.senders.is_empty() {
                        return None;
                    }
                    let idx = g.next.fetch_add(1, Ordering::Relaxed) % g.senders.len();
                    Some(g.senders[idx].clone())
                })
                .collect(),
            None => Vec::new(),
        };

        for sender in targets {
            sender
                .send(message.clone())
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut groups = self.topics.entry(topic.to_string()).or_default();
        match groups.iter_mut().find(|g| g.group == group) {
            Some(existing) => existing.senders.push(tx),
            None => groups.push(GroupSubscribers {
                group: group.to_string(),
                senders: vec![tx],
                next: AtomicUsize::new(0),
            }),
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_across_groups_single_delivery_within_group() {
        let bus = InMemoryEventBus::new();
        let mut a1 = bus.subscribe("t", "group-a").await.unwrap();
        let mut a2 = bus.subscribe("t", "group-a").await.unwrap();
        let mut b = bus.subscribe("t", "group-b").await.unwrap();

        bus.publish("t", Some("k1"), "m1".into()).await.unwrap();
        bus.publish("t", Some("k1"), "m2".into()).await.unwrap();

        // group-b sees everything
        assert_eq!(b.recv().await.unwrap().payload, "m1");
        assert_eq!(b.recv().await.unwrap().payload, "m2");

        // group-a shares the work: one message each, round-robin
        let first = a1.recv().await.unwrap();
        let second = a2.recv().await.unwrap();
        let mut payloads = vec![first.payload, second.payload];
        payloads.sort();
        assert_eq!(payloads, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn key_is_carried_through() {
        let bus = InMemoryEventBus::new();
        let mut rx = bus.subscribe("t", "g").await.unwrap();
        bus.publish("t", Some("CP-7"), "{}".into()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().key.as_deref(), Some("CP-7"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::new();
        bus.publish("nobody", None, "{}".into()).await.unwrap();
    }
}
