//! Receive loop that turns a [`Subscription`] into handler calls.
//!
//! Settlement policy:
//! - body that does not decode: nack without requeue (poison message);
//! - handler `Ok`: ack;
//! - handler error that is retryable: nack with requeue;
//! - any other handler error: nack without requeue.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::error::{BusError, HandlerError};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    /// Upper bound on deliveries of one message; `None` retries forever.
    pub max_deliveries: Option<u32>,
    /// Pause after a requeue so a failing dependency is not hammered.
    pub requeue_delay: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_deliveries: None,
            requeue_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Drop,
}

pub fn settlement_for(
    outcome: &Result<(), HandlerError>,
    delivery_count: u32,
    options: &ConsumerOptions,
) -> Settlement {
    match outcome {
        Ok(()) => Settlement::Ack,
        Err(e) if !e.is_retryable() => Settlement::Drop,
        Err(_) => match options.max_deliveries {
            Some(max) if delivery_count >= max => Settlement::Drop,
            _ => Settlement::Requeue,
        },
    }
}

/// Subscribes to `queue` and runs the receive loop on its own task.
pub async fn spawn_consumer<E, H, Fut>(
    bus: &dyn EventBus,
    queue: &str,
    handler: H,
    options: ConsumerOptions,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>, BusError>
where
    E: DeserializeOwned + Send + 'static,
    H: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let subscription = bus.subscribe(queue).await?;
    let queue = queue.to_string();
    Ok(tokio::spawn(async move {
        run_consumer(subscription, &queue, handler, options, shutdown).await;
    }))
}

pub async fn run_consumer<E, H, Fut>(
    mut subscription: Box<dyn Subscription>,
    queue: &str,
    handler: H,
    options: ConsumerOptions,
    mut shutdown: Shutdown,
) where
    E: DeserializeOwned,
    H: Fn(E) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    info!(queue, "consumer started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = subscription.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(queue, error = %e, "failed to receive message");
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
            None => {
                warn!(queue, "subscription closed");
                break;
            }
        };

        let settlement = match serde_json::from_slice::<E>(&delivery.payload) {
            Ok(event) => {
                let outcome = handler(event).await;
                if let Err(e) = &outcome {
                    warn!(
                        queue,
                        routing_key = %delivery.routing_key,
                        delivery_count = delivery.delivery_count,
                        retryable = e.is_retryable(),
                        error = %e,
                        "handler failed"
                    );
                }
                let settlement = settlement_for(&outcome, delivery.delivery_count, &options);
                if settlement == Settlement::Drop && outcome.as_ref().is_err_and(|e| e.is_retryable()) {
                    error!(
                        queue,
                        delivery_count = delivery.delivery_count,
                        "giving up on message after repeated failures"
                    );
                }
                settlement
            }
            Err(e) => {
                warn!(queue, routing_key = %delivery.routing_key, error = %e, "dropping malformed message");
                Settlement::Drop
            }
        };

        let settled = match settlement {
            Settlement::Ack => subscription.ack().await,
            Settlement::Requeue => subscription.nack(true).await,
            Settlement::Drop => subscription.nack(false).await,
        };
        if let Err(e) = settled {
            error!(queue, error = %e, "failed to settle message");
        }
        debug!(queue, ?settlement, "message settled");

        if settlement == Settlement::Requeue && !options.requeue_delay.is_zero() {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(options.requeue_delay) => {}
            }
        }
    }

    info!(queue, "consumer stopped");
}
