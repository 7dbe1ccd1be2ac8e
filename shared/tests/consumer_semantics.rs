use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::bus::{EventBus, InMemoryBus, OutgoingMessage, Topology};
use shared::consumer::{spawn_consumer, ConsumerOptions};
use shared::error::{HandlerError, RepositoryError};
use shared::shutdown;

const EXCHANGE: &str = "payment.events";
const QUEUE: &str = "order.payment.success";
const KEY: &str = "payment.success";

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

fn options() -> ConsumerOptions {
    ConsumerOptions {
        max_deliveries: None,
        requeue_delay: Duration::from_millis(5),
    }
}

async fn bus() -> InMemoryBus {
    let bus = InMemoryBus::new();
    bus.declare_topology(&Topology::new().exchange(EXCHANGE).bind(QUEUE, EXCHANGE, KEY))
        .await
        .unwrap();
    bus
}

async fn publish_raw(bus: &InMemoryBus, body: &[u8]) {
    bus.publish(OutgoingMessage {
        exchange: EXCHANGE.to_string(),
        routing_key: KEY.to_string(),
        payload: body.to_vec(),
        expiration: None,
    })
    .await
    .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_malformed_message_is_dropped_not_redelivered() {
    let bus = bus().await;
    let calls = Arc::new(AtomicU32::new(0));
    let (trigger, shutdown) = shutdown::channel();

    let seen = calls.clone();
    let handle = spawn_consumer(
        &bus,
        QUEUE,
        move |_: Ping| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        options(),
        shutdown,
    )
    .await
    .unwrap();

    publish_raw(&bus, b"{not json").await;
    publish_raw(&bus, br#"{"n":1}"#).await;

    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.queue_depth(QUEUE), 0);

    trigger.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_is_redelivered_until_success() {
    let bus = bus().await;
    let attempts = Arc::new(AtomicU32::new(0));
    let (trigger, shutdown) = shutdown::channel();

    let seen = attempts.clone();
    let handle = spawn_consumer(
        &bus,
        QUEUE,
        move |_: Ping| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::Repository(RepositoryError::unavailable("db down")))
                } else {
                    Ok(())
                }
            }
        },
        options(),
        shutdown,
    )
    .await
    .unwrap();

    publish_raw(&bus, br#"{"n":7}"#).await;

    eventually(|| attempts.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(bus.queue_depth(QUEUE), 0);

    trigger.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let bus = bus().await;
    let attempts = Arc::new(AtomicU32::new(0));
    let (trigger, shutdown) = shutdown::channel();

    let seen = attempts.clone();
    let handle = spawn_consumer(
        &bus,
        QUEUE,
        move |_: Ping| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::InvalidEvent("malformed order id".into()))
            }
        },
        options(),
        shutdown,
    )
    .await
    .unwrap();

    publish_raw(&bus, br#"{"n":1}"#).await;
    eventually(|| attempts.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    trigger.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_bounded_retries_give_up() {
    let bus = bus().await;
    let attempts = Arc::new(AtomicU32::new(0));
    let (trigger, shutdown) = shutdown::channel();

    let seen = attempts.clone();
    let handle = spawn_consumer(
        &bus,
        QUEUE,
        move |_: Ping| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Repository(RepositoryError::unavailable("db down")))
            }
        },
        ConsumerOptions {
            max_deliveries: Some(4),
            requeue_delay: Duration::from_millis(1),
        },
        shutdown,
    )
    .await
    .unwrap();

    publish_raw(&bus, br#"{"n":1}"#).await;
    eventually(|| attempts.load(Ordering::SeqCst) == 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(bus.queue_depth(QUEUE), 0);

    trigger.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_handler_finish() {
    let bus = bus().await;
    let finished = Arc::new(AtomicU32::new(0));
    let (trigger, shutdown) = shutdown::channel();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));

    let done = finished.clone();
    let handle = spawn_consumer(
        &bus,
        QUEUE,
        move |_: Ping| {
            let done = done.clone();
            let started_tx = started_tx.clone();
            async move {
                if let Some(tx) = started_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        options(),
        shutdown,
    )
    .await
    .unwrap();

    publish_raw(&bus, br#"{"n":1}"#).await;
    publish_raw(&bus, br#"{"n":2}"#).await;
    started_rx.await.unwrap();
    trigger.trigger();

    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    // The second message was never pulled.
    assert_eq!(bus.queue_depth(QUEUE), 1);
}
