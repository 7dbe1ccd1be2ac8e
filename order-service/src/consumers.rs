use std::sync::Arc;

use shared::{
    order_queues, spawn_consumer, BusError, ConsumerOptions, DelayQueue, EventBus, PaymentFailedEvent,
    PaymentSuccessEvent, PaymentTimeoutEvent, Shutdown, Topology, ORDER_EVENTS_EXCHANGE, PAYMENT_EVENTS_EXCHANGE,
    PAYMENT_FAILED, PAYMENT_SUCCESS, PAYMENT_TIMEOUT,
};
use tokio::task::JoinHandle;

use crate::saga::OrderSaga;

/// Exchanges, queues and the timeout delay queue order-service relies on.
pub fn topology(timeout_queue: &DelayQueue) -> Topology {
    Topology::new()
        .exchange(ORDER_EVENTS_EXCHANGE)
        .exchange(PAYMENT_EVENTS_EXCHANGE)
        .bind(order_queues::PAYMENT_SUCCESS, PAYMENT_EVENTS_EXCHANGE, PAYMENT_SUCCESS)
        .bind(order_queues::PAYMENT_FAILED, PAYMENT_EVENTS_EXCHANGE, PAYMENT_FAILED)
        .bind(order_queues::PAYMENT_TIMEOUT, ORDER_EVENTS_EXCHANGE, PAYMENT_TIMEOUT)
        .delay_queue(timeout_queue.clone())
}

/// Starts one consumer task per payment outcome queue.
pub async fn spawn_all(
    bus: &dyn EventBus,
    saga: Arc<OrderSaga>,
    options: ConsumerOptions,
    shutdown: Shutdown,
) -> Result<Vec<JoinHandle<()>>, BusError> {
    let success = {
        let saga = saga.clone();
        spawn_consumer(
            bus,
            order_queues::PAYMENT_SUCCESS,
            move |event: PaymentSuccessEvent| {
                let saga = saga.clone();
                async move { saga.on_payment_success(event).await }
            },
            options,
            shutdown.clone(),
        )
        .await?
    };

    let failed = {
        let saga = saga.clone();
        spawn_consumer(
            bus,
            order_queues::PAYMENT_FAILED,
            move |event: PaymentFailedEvent| {
                let saga = saga.clone();
                async move { saga.on_payment_failed(event).await }
            },
            options,
            shutdown.clone(),
        )
        .await?
    };

    let timeout = spawn_consumer(
        bus,
        order_queues::PAYMENT_TIMEOUT,
        move |event: PaymentTimeoutEvent| {
            let saga = saga.clone();
            async move { saga.on_payment_timeout(event).await }
        },
        options,
        shutdown,
    )
    .await?;

    Ok(vec![success, failed, timeout])
}
