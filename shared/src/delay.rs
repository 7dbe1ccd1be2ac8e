use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::{DelayQueue, EventBus, OutgoingMessage, DEFAULT_EXCHANGE};
use crate::error::PublishError;
use crate::events::{order_queues, PaymentTimeoutEvent, ORDER_EVENTS_EXCHANGE, PAYMENT_TIMEOUT};

/// The delay queue that turns into `payment.timeout` on `order.events`.
pub fn payment_timeout_queue(ttl: Duration) -> DelayQueue {
    DelayQueue {
        name: order_queues::PAYMENT_TIMEOUT_DELAY.to_string(),
        ttl,
        dead_letter_exchange: ORDER_EVENTS_EXCHANGE.to_string(),
        dead_letter_routing_key: PAYMENT_TIMEOUT.to_string(),
    }
}

/// Schedules payment-timeout checks by parking messages in a delay queue.
#[derive(Clone)]
pub struct TimeoutScheduler {
    bus: Arc<dyn EventBus>,
    queue: DelayQueue,
}

impl TimeoutScheduler {
    pub fn new(bus: Arc<dyn EventBus>, queue: DelayQueue) -> Self {
        Self { bus, queue }
    }

    pub fn queue(&self) -> &DelayQueue {
        &self.queue
    }

    /// Publishes a [`PaymentTimeoutEvent`] that surfaces in the timeout queue
    /// `delay` after now. `delay` may not exceed the queue TTL.
    pub async fn schedule_timeout(&self, order_id: Uuid, delay: Duration) -> Result<(), PublishError> {
        if delay > self.queue.ttl {
            return Err(PublishError::Rejected {
                exchange: DEFAULT_EXCHANGE.to_string(),
                routing_key: self.queue.name.clone(),
                reason: format!(
                    "delay of {}ms exceeds queue TTL of {}ms",
                    delay.as_millis(),
                    self.queue.ttl.as_millis()
                ),
            });
        }
        let event = PaymentTimeoutEvent {
            order_id: order_id.to_string(),
            created_at: Utc::now(),
        };
        let message = OutgoingMessage::json(DEFAULT_EXCHANGE, &self.queue.name, &event)?.with_expiration(delay);
        self.bus.publish(message).await?;
        tracing::debug!(%order_id, delay_ms = delay.as_millis() as u64, "scheduled payment timeout");
        Ok(())
    }
}
