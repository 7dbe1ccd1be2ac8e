//! Broker abstraction shared by every service.
//!
//! The model is a durable topic-exchange broker: messages are published to
//! an exchange with a routing key, queues are bound to exchanges by routing
//! pattern, and consumers settle each delivery with an ack or a nack. Two
//! backends exist: [`KafkaBus`] for deployments and [`InMemoryBus`] for tests.

mod kafka;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{BusError, PublishError};

pub use kafka::KafkaBus;
pub use memory::InMemoryBus;

/// The exchange that routes straight to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A queue that is never consumed: messages sit for `ttl` and are then
/// re-published to the dead-letter exchange with the dead-letter routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayQueue {
    pub name: String,
    pub ttl: Duration,
    pub dead_letter_exchange: String,
    pub dead_letter_routing_key: String,
}

/// Exchanges, queues and bindings a service needs. Declaring is idempotent.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub exchanges: Vec<String>,
    pub bindings: Vec<Binding>,
    pub delay_queues: Vec<DelayQueue>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, name: &str) -> Self {
        if !self.exchanges.iter().any(|e| e == name) {
            self.exchanges.push(name.to_string());
        }
        self
    }

    pub fn bind(mut self, queue: &str, exchange: &str, routing_key: &str) -> Self {
        self.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        self
    }

    pub fn delay_queue(mut self, queue: DelayQueue) -> Self {
        self.delay_queues.push(queue);
        self
    }

    pub fn bindings_for<'a>(&'a self, queue: &'a str) -> impl Iterator<Item = &'a Binding> + 'a {
        self.bindings.iter().filter(move |b| b.queue == queue)
    }
}

/// A message on its way to the broker. Always published as persistent.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Per-message TTL; only meaningful when routed to a queue with a dead-letter target.
    pub expiration: Option<Duration>,
}

impl OutgoingMessage {
    pub fn json<T: Serialize>(exchange: &str, routing_key: &str, body: &T) -> Result<Self, PublishError> {
        let payload = serde_json::to_vec(body).map_err(|e| PublishError::Serialization {
            routing_key: routing_key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            expiration: None,
        })
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    /// 1 on first delivery, incremented on every requeue.
    pub delivery_count: u32,
}

/// A stream of deliveries from one queue, at most one unsettled at a time.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` means the subscription is closed.
    async fn next(&mut self) -> Option<Result<Delivery, BusError>>;

    /// Removes the current delivery from the queue.
    async fn ack(&mut self) -> Result<(), BusError>;

    /// Rejects the current delivery; with `requeue` it is delivered again.
    async fn nack(&mut self, requeue: bool) -> Result<(), BusError>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BusError>;

    async fn publish(&self, message: OutgoingMessage) -> Result<(), PublishError>;

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError>;
}

/// Serializes `body` as JSON and publishes it persistently.
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn EventBus,
    exchange: &str,
    routing_key: &str,
    body: &T,
) -> Result<(), PublishError> {
    let message = OutgoingMessage::json(exchange, routing_key, body)?;
    bus.publish(message).await
}

/// Topic-exchange matching: words are dot separated, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_binding_matches_only_itself() {
        assert!(topic_matches("payment.success", "payment.success"));
        assert!(!topic_matches("payment.success", "payment.failed"));
        assert!(!topic_matches("payment.success", "payment.success.retry"));
    }

    #[test]
    fn test_wildcards() {
        assert!(topic_matches("payment.*", "payment.failed"));
        assert!(!topic_matches("payment.*", "payment.checkout.created"));
        assert!(topic_matches("payment.#", "payment.checkout.created"));
        assert!(topic_matches("#", "order.created"));
        assert!(topic_matches("#.created", "order.created"));
        assert!(!topic_matches("*.created", "payment.checkout.created"));
    }

    #[test]
    fn test_topology_builder_dedupes_exchanges() {
        let topology = Topology::new()
            .exchange("order.events")
            .exchange("order.events")
            .bind("q", "order.events", "order.created");
        assert_eq!(topology.exchanges.len(), 1);
        assert_eq!(topology.bindings_for("q").count(), 1);
        assert_eq!(topology.bindings_for("other").count(), 0);
    }
}
