mod common;

use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use common::{eventually, order_request, Harness};
use order_service::models::OrderStatus;
use order_service::store::OrderStore;
use shared::{
    order_queues, publish_json, OrderCreatedEvent, PaymentFailedEvent, PaymentSuccessEvent, PaymentTimeoutEvent,
    ORDER_CREATED, ORDER_EVENTS_EXCHANGE, PAYMENT_EVENTS_EXCHANGE, PAYMENT_FAILED, PAYMENT_SUCCESS, PAYMENT_TIMEOUT,
};
use uuid::Uuid;

fn success_for(order_id: &str) -> PaymentSuccessEvent {
    PaymentSuccessEvent {
        order_id: order_id.to_string(),
        user_id: Uuid::new_v4().to_string(),
        amount: 20.0,
        currency: "usd".to_string(),
        gateway_intent_id: "pi_123".to_string(),
        gateway_charge_id: "ch_123".to_string(),
        timestamp: Utc::now(),
    }
}

async fn status_of(h: &Harness, id: Uuid) -> Option<OrderStatus> {
    h.store
        .find_by_id(id)
        .await
        .ok()
        .flatten()
        .and_then(|details| details.order.status().ok())
}

async fn wait_for_status(h: &Harness, id: Uuid, expected: OrderStatus) {
    eventually(|| async move { status_of(h, id).await == Some(expected) }).await;
}

async fn wait_drained(h: &Harness, queue: &str) {
    eventually(|| async move { h.bus.queue_depth(queue) == 0 }).await;
}

#[tokio::test]
async fn test_create_order_prices_items_and_announces_it() {
    let h = Harness::start(Duration::from_secs(60)).await;
    let (user, food) = (Uuid::new_v4(), Uuid::new_v4());
    h.catalog.insert(food, "margherita", 10.00);

    let details = h.saga.create_order(order_request(user, &[(food, 2)])).await.unwrap();

    assert_eq!(details.order.total_amount, "20.00".parse::<BigDecimal>().unwrap());
    assert_eq!(details.order.status().unwrap(), OrderStatus::Pending);
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].quantity, 2);

    let announced = h.bus.published::<OrderCreatedEvent>(ORDER_CREATED);
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].order_id, details.order.id.to_string());
    assert_eq!(announced[0].user_id, user.to_string());
    assert_eq!(announced[0].amount, 20.0);
    assert_eq!(announced[0].currency, "usd");

    // The timeout check is parked in the delay queue.
    assert_eq!(h.bus.queue_depth(order_queues::PAYMENT_TIMEOUT_DELAY), 1);
    h.stop().await;
}

#[tokio::test]
async fn test_payment_success_confirms_once_despite_redelivery() {
    let h = Harness::start(Duration::from_secs(60)).await;
    let food = Uuid::new_v4();
    h.catalog.insert(food, "ramen", 10.0);
    let order_id = h.saga.create_order(order_request(Uuid::new_v4(), &[(food, 2)])).await.unwrap().order.id;

    for _ in 0..3 {
        publish_json(&h.bus, PAYMENT_EVENTS_EXCHANGE, PAYMENT_SUCCESS, &success_for(&order_id.to_string()))
            .await
            .unwrap();
    }

    wait_for_status(&h, order_id, OrderStatus::Confirmed).await;
    wait_drained(&h, order_queues::PAYMENT_SUCCESS).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(status_of(&h, order_id).await, Some(OrderStatus::Confirmed));
    h.stop().await;
}

#[tokio::test]
async fn test_payment_failed_marks_order() {
    let h = Harness::start(Duration::from_secs(60)).await;
    let food = Uuid::new_v4();
    h.catalog.insert(food, "ramen", 10.0);
    let order = h.saga.create_order(order_request(Uuid::new_v4(), &[(food, 1)])).await.unwrap().order;

    let failed = PaymentFailedEvent {
        order_id: order.id.to_string(),
        customer_id: order.user_id.to_string(),
        payment_id: Uuid::new_v4().to_string(),
        failure_reason: "Your card was declined.".to_string(),
        failure_code: "card_declined".to_string(),
        timestamp: Utc::now(),
    };
    publish_json(&h.bus, PAYMENT_EVENTS_EXCHANGE, PAYMENT_FAILED, &failed).await.unwrap();

    wait_for_status(&h, order.id, OrderStatus::PaymentFailed).await;
    h.stop().await;
}

#[tokio::test]
async fn test_timeout_does_not_override_confirmed_order() {
    let h = Harness::start(Duration::from_secs(60)).await;
    let food = Uuid::new_v4();
    h.catalog.insert(food, "ramen", 10.0);
    let order_id = h.saga.create_order(order_request(Uuid::new_v4(), &[(food, 1)])).await.unwrap().order.id;

    publish_json(&h.bus, PAYMENT_EVENTS_EXCHANGE, PAYMENT_SUCCESS, &success_for(&order_id.to_string()))
        .await
        .unwrap();
    wait_for_status(&h, order_id, OrderStatus::Confirmed).await;

    let timeout = PaymentTimeoutEvent {
        order_id: order_id.to_string(),
        created_at: Utc::now(),
    };
    publish_json(&h.bus, ORDER_EVENTS_EXCHANGE, PAYMENT_TIMEOUT, &timeout).await.unwrap();
    wait_drained(&h, order_queues::PAYMENT_TIMEOUT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(status_of(&h, order_id).await, Some(OrderStatus::Confirmed));
    h.stop().await;
}

#[tokio::test]
async fn test_timeout_does_not_override_failed_payment() {
    let h = Harness::start(Duration::from_secs(60)).await;
    let food = Uuid::new_v4();
    h.catalog.insert(food, "ramen", 10.0);
    let order = h.saga.create_order(order_request(Uuid::new_v4(), &[(food, 1)])).await.unwrap().order;

    let failed = PaymentFailedEvent {
        order_id: order.id.to_string(),
        customer_id: order.user_id.to_string(),
        payment_id: Uuid::new_v4().to_string(),
        failure_reason: "Your card was declined.".to_string(),
        failure_code: "card_declined".to_string(),
        timestamp: Utc::now(),
    };
    publish_json(&h.bus, PAYMENT_EVENTS_EXCHANGE, PAYMENT_FAILED, &failed).await.unwrap();
    wait_for_status(&h, order.id, OrderStatus::PaymentFailed).await;

    let timeout = PaymentTimeoutEvent {
        order_id: order.id.to_string(),
        created_at: Utc::now(),
    };
    publish_json(&h.bus, ORDER_EVENTS_EXCHANGE, PAYMENT_TIMEOUT, &timeout).await.unwrap();
    wait_drained(&h, order_queues::PAYMENT_TIMEOUT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(status_of(&h, order.id).await, Some(OrderStatus::PaymentFailed));
    h.stop().await;
}

#[tokio::test]
async fn test_unpaid_order_is_cancelled_when_timeout_fires() {
    let h = Harness::start(Duration::from_millis(100)).await;
    let food = Uuid::new_v4();
    h.catalog.insert(food, "ramen", 10.0);
    let order_id = h.saga.create_order(order_request(Uuid::new_v4(), &[(food, 1)])).await.unwrap().order.id;

    assert_eq!(status_of(&h, order_id).await, Some(OrderStatus::Pending));
    wait_for_status(&h, order_id, OrderStatus::Cancelled).await;
    h.stop().await;
}

#[tokio::test]
async fn test_malformed_order_id_is_dropped() {
    let h = Harness::start(Duration::from_secs(60)).await;
    let food = Uuid::new_v4();
    h.catalog.insert(food, "ramen", 10.0);
    let order_id = h.saga.create_order(order_request(Uuid::new_v4(), &[(food, 1)])).await.unwrap().order.id;

    publish_json(&h.bus, PAYMENT_EVENTS_EXCHANGE, PAYMENT_SUCCESS, &success_for("not-a-uuid"))
        .await
        .unwrap();
    publish_json(&h.bus, PAYMENT_EVENTS_EXCHANGE, PAYMENT_SUCCESS, &success_for(&order_id.to_string()))
        .await
        .unwrap();

    // The queue is FIFO with one delivery in flight, so reaching the second
    // message means the first was settled without requeue.
    wait_for_status(&h, order_id, OrderStatus::Confirmed).await;
    wait_drained(&h, order_queues::PAYMENT_SUCCESS).await;
    h.stop().await;
}

#[tokio::test]
async fn test_store_outage_is_retried_until_it_recovers() {
    let h = Harness::start(Duration::from_secs(60)).await;
    let food = Uuid::new_v4();
    h.catalog.insert(food, "ramen", 10.0);
    let order_id = h.saga.create_order(order_request(Uuid::new_v4(), &[(food, 1)])).await.unwrap().order.id;

    h.store.set_unavailable(true);
    publish_json(&h.bus, PAYMENT_EVENTS_EXCHANGE, PAYMENT_SUCCESS, &success_for(&order_id.to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.store.set_unavailable(false);

    wait_for_status(&h, order_id, OrderStatus::Confirmed).await;
    h.stop().await;
}
