#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use order_service::catalog::InMemoryFoodCatalog;
use order_service::consumers;
use order_service::saga::{CreateOrder, OrderItemRequest, OrderSaga, SagaSettings};
use order_service::store::InMemoryOrderStore;
use shared::shutdown::{self, ShutdownTrigger};
use shared::{payment_timeout_queue, ConsumerOptions, EventBus, InMemoryBus, TimeoutScheduler};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct Harness {
    pub saga: Arc<OrderSaga>,
    pub store: Arc<InMemoryOrderStore>,
    pub catalog: Arc<InMemoryFoodCatalog>,
    pub bus: InMemoryBus,
    trigger: ShutdownTrigger,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    /// Saga wired to in-memory collaborators with its consumers running.
    pub async fn start(payment_timeout: Duration) -> Self {
        let bus = InMemoryBus::new();
        let timeouts = TimeoutScheduler::new(Arc::new(bus.clone()), payment_timeout_queue(payment_timeout));
        bus.declare_topology(&consumers::topology(timeouts.queue())).await.unwrap();

        let store = Arc::new(InMemoryOrderStore::new());
        let catalog = Arc::new(InMemoryFoodCatalog::new());
        let saga = Arc::new(OrderSaga::new(
            store.clone(),
            catalog.clone(),
            Arc::new(bus.clone()),
            timeouts,
            SagaSettings {
                currency: "usd".to_string(),
                payment_timeout,
            },
        ));

        let (trigger, shutdown) = shutdown::channel();
        let options = ConsumerOptions {
            max_deliveries: None,
            requeue_delay: Duration::from_millis(10),
        };
        let workers = consumers::spawn_all(&bus, saga.clone(), options, shutdown).await.unwrap();

        Self {
            saga,
            store,
            catalog,
            bus,
            trigger,
            workers,
        }
    }

    pub async fn stop(self) {
        self.trigger.trigger();
        for worker in self.workers {
            worker.await.unwrap();
        }
    }
}

pub fn order_request(user_id: Uuid, items: &[(Uuid, i32)]) -> CreateOrder {
    CreateOrder {
        user_id,
        order_items: items
            .iter()
            .map(|&(food_id, quantity)| OrderItemRequest { food_id, quantity })
            .collect(),
        payment_method_id: None,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}
