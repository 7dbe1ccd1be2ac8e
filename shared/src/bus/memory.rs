use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use super::{
    topic_matches, Binding, Delivery, EventBus, OutgoingMessage, Subscription, Topology, DEFAULT_EXCHANGE,
};
use crate::error::{BusError, PublishError};

/// In-process broker with exchange/queue/binding semantics, TTL and
/// dead-letter routing. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    connected: AtomicBool,
}

#[derive(Default)]
struct State {
    exchanges: Vec<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Queue>,
    published: Vec<OutgoingMessage>,
    next_id: u64,
}

struct Queue {
    ready: VecDeque<Stored>,
    notify: Arc<Notify>,
    ttl: Option<Duration>,
    dead_letter: Option<(String, String)>,
}

impl Queue {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            ttl: None,
            dead_letter: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    id: u64,
    routing_key: String,
    payload: Vec<u8>,
    delivery_count: u32,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Simulates losing (or regaining) the broker connection.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Messages waiting in `queue`, not counting an unsettled delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Every message accepted by `publish` with this routing key, decoded as `T`.
    pub fn published<T: DeserializeOwned>(&self, routing_key: &str) -> Vec<T> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(
        self: &Arc<Self>,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<(), PublishError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            if !state.exchanges.iter().any(|e| e == exchange) {
                return Err(PublishError::Rejected {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "no such exchange".to_string(),
                });
            }
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        for queue_name in targets {
            state.next_id += 1;
            let stored = Stored {
                id: state.next_id,
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                delivery_count: 0,
            };
            let Some(queue) = state.queues.get_mut(&queue_name) else {
                continue;
            };
            let ttl = match (queue.ttl, expiration) {
                (Some(q), Some(m)) => Some(q.min(m)),
                (q, m) => q.or(m),
            };
            if let (Some(ttl), true) = (ttl, queue.dead_letter.is_some()) {
                let inner = Arc::clone(self);
                let id = stored.id;
                let name = queue_name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    inner.expire(&name, id);
                });
            }
            queue.ready.push_back(stored);
            queue.notify.notify_one();
        }
        Ok(())
    }

    fn expire(self: &Arc<Self>, queue_name: &str, id: u64) {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some(pos) = queue.ready.iter().position(|m| m.id == id) else {
            return;
        };
        let Some(message) = queue.ready.remove(pos) else {
            return;
        };
        self.dead_letter(&mut state, queue_name, message);
    }

    fn dead_letter(self: &Arc<Self>, state: &mut State, queue_name: &str, message: Stored) {
        let Some((exchange, routing_key)) = state.queues.get(queue_name).and_then(|q| q.dead_letter.clone())
        else {
            tracing::debug!(queue = queue_name, "dropping rejected message");
            return;
        };
        if let Err(e) = self.route(state, &exchange, &routing_key, message.payload, None) {
            tracing::warn!(queue = queue_name, error = %e, "dead-letter routing failed");
        }
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BusError> {
        let mut state = self.inner.lock();
        for exchange in &topology.exchanges {
            if !state.exchanges.contains(exchange) {
                state.exchanges.push(exchange.clone());
            }
        }
        for binding in &topology.bindings {
            state.queues.entry(binding.queue.clone()).or_insert_with(Queue::new);
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
        }
        for delay in &topology.delay_queues {
            let queue = state.queues.entry(delay.name.clone()).or_insert_with(Queue::new);
            let dead_letter = (delay.dead_letter_exchange.clone(), delay.dead_letter_routing_key.clone());
            let conflicting = queue.ttl.is_some_and(|ttl| ttl != delay.ttl)
                || queue.dead_letter.as_ref().is_some_and(|dl| *dl != dead_letter);
            if conflicting {
                return Err(BusError::Declare {
                    name: delay.name.clone(),
                    reason: "queue already declared with different arguments".to_string(),
                });
            }
            queue.ttl = Some(delay.ttl);
            queue.dead_letter = Some(dead_letter);
        }
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<(), PublishError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(PublishError::Disconnected);
        }
        let mut state = self.inner.lock();
        self.inner.route(
            &mut state,
            &message.exchange,
            &message.routing_key,
            message.payload.clone(),
            message.expiration,
        )?;
        state.published.push(message);
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError> {
        if !self.inner.lock().queues.contains_key(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            in_flight: None,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    queue: String,
    in_flight: Option<Stored>,
}

impl MemorySubscription {
    fn settle(&mut self) -> Result<Stored, BusError> {
        self.in_flight.take().ok_or_else(|| BusError::Settle {
            queue: self.queue.clone(),
            reason: "no delivery in flight".to_string(),
        })
    }

    fn requeue(&self, message: Stored) {
        let mut state = self.inner.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.ready.push_front(message);
            queue.notify.notify_one();
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BusError>> {
        if self.in_flight.is_some() {
            return Some(Err(BusError::Settle {
                queue: self.queue.clone(),
                reason: "previous delivery not settled".to_string(),
            }));
        }
        loop {
            let notify = {
                let mut state = self.inner.lock();
                let Some(queue) = state.queues.get_mut(&self.queue) else {
                    return Some(Err(BusError::UnknownQueue(self.queue.clone())));
                };
                if let Some(mut message) = queue.ready.pop_front() {
                    message.delivery_count += 1;
                    let delivery = Delivery {
                        routing_key: message.routing_key.clone(),
                        payload: message.payload.clone(),
                        redelivered: message.delivery_count > 1,
                        delivery_count: message.delivery_count,
                    };
                    self.in_flight = Some(message);
                    return Some(Ok(delivery));
                }
                Arc::clone(&queue.notify)
            };
            notify.notified().await;
        }
    }

    async fn ack(&mut self) -> Result<(), BusError> {
        self.settle().map(|_| ())
    }

    async fn nack(&mut self, requeue: bool) -> Result<(), BusError> {
        let message = self.settle()?;
        if requeue {
            self.requeue(message);
        } else {
            let mut state = self.inner.lock();
            self.inner.dead_letter(&mut state, &self.queue, message);
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        // Unsettled deliveries go back to the queue, as on a closed channel.
        if let Some(message) = self.in_flight.take() {
            self.requeue(message);
        }
    }
}
