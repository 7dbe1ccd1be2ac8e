use std::sync::Arc;

use shared::{
    payment_queues, spawn_consumer, BusError, ConsumerOptions, EventBus, OrderCreatedEvent, Shutdown, Topology,
    ORDER_CREATED, ORDER_EVENTS_EXCHANGE, PAYMENT_EVENTS_EXCHANGE,
};
use tokio::task::JoinHandle;

use crate::processor::PaymentProcessor;

/// payment-service consumes `order.created` and publishes on `payment.events`.
pub fn topology() -> Topology {
    Topology::new()
        .exchange(ORDER_EVENTS_EXCHANGE)
        .exchange(PAYMENT_EVENTS_EXCHANGE)
        .bind(payment_queues::ORDER_CREATED, ORDER_EVENTS_EXCHANGE, ORDER_CREATED)
}

pub async fn spawn_all(
    bus: &dyn EventBus,
    processor: Arc<PaymentProcessor>,
    options: ConsumerOptions,
    shutdown: Shutdown,
) -> Result<Vec<JoinHandle<()>>, BusError> {
    let order_created = spawn_consumer(
        bus,
        payment_queues::ORDER_CREATED,
        move |event: OrderCreatedEvent| {
            let processor = processor.clone();
            async move { processor.process_order_created(event).await }
        },
        options,
        shutdown,
    )
    .await?;

    Ok(vec![order_created])
}
