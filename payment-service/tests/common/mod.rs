#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use payment_service::consumers;
use payment_service::gateway::{
    CheckoutRequest, CheckoutSession, GatewayError, IntentRequest, PaymentGateway, PaymentIntent,
};
use payment_service::processor::{PaymentMode, PaymentProcessor, ProcessorSettings};
use payment_service::store::InMemoryPaymentStore;
use shared::shutdown::{self, ShutdownTrigger};
use shared::{publish_json, ConsumerOptions, EventBus, InMemoryBus, OrderCreatedEvent, ORDER_CREATED, ORDER_EVENTS_EXCHANGE};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const INTENT_ID: &str = "pi_123";
pub const CHARGE_ID: &str = "ch_123";

/// Gateway double that either approves or declines every confirmation.
pub struct FakeGateway {
    approve: bool,
    confirmations: AtomicUsize,
    sessions: AtomicUsize,
}

impl FakeGateway {
    pub fn approving() -> Arc<Self> {
        Arc::new(Self {
            approve: true,
            confirmations: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
        })
    }

    pub fn declining() -> Arc<Self> {
        Arc::new(Self {
            approve: false,
            confirmations: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
        })
    }

    pub fn confirmations(&self) -> usize {
        self.confirmations.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let id = format!("cs_{}", request.order_id.simple());
        Ok(CheckoutSession {
            url: format!("https://checkout.test/{id}"),
            id,
            expires_at: None,
        })
    }

    async fn create_payment_intent(&self, _: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        Ok(PaymentIntent {
            id: INTENT_ID.to_string(),
            status: "requires_confirmation".to_string(),
            latest_charge: None,
            last_payment_error: None,
        })
    }

    async fn confirm_payment_intent(&self, intent_id: &str, _: &str, _: &str) -> Result<PaymentIntent, GatewayError> {
        self.confirmations.fetch_add(1, Ordering::SeqCst);
        if !self.approve {
            return Err(GatewayError::Declined {
                code: "card_declined".to_string(),
                reason: "Your card was declined.".to_string(),
            });
        }
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            status: "succeeded".to_string(),
            latest_charge: Some(CHARGE_ID.to_string()),
            last_payment_error: None,
        })
    }

    async fn get_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            status: "succeeded".to_string(),
            latest_charge: Some(CHARGE_ID.to_string()),
            last_payment_error: None,
        })
    }
}

pub fn fast_retries() -> ConsumerOptions {
    ConsumerOptions {
        max_deliveries: None,
        requeue_delay: Duration::from_millis(10),
    }
}

pub struct Harness {
    pub processor: Arc<PaymentProcessor>,
    pub store: Arc<InMemoryPaymentStore>,
    pub gateway: Arc<FakeGateway>,
    pub bus: InMemoryBus,
    trigger: ShutdownTrigger,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn start(mode: PaymentMode, gateway: Arc<FakeGateway>) -> Self {
        Self::start_on(InMemoryBus::new(), mode, gateway).await
    }

    /// Processor and its `order.created` consumer running on `bus`.
    pub async fn start_on(bus: InMemoryBus, mode: PaymentMode, gateway: Arc<FakeGateway>) -> Self {
        bus.declare_topology(&consumers::topology()).await.unwrap();

        let store = Arc::new(InMemoryPaymentStore::new());
        let processor = Arc::new(PaymentProcessor::new(
            store.clone(),
            gateway.clone(),
            Arc::new(bus.clone()),
            ProcessorSettings {
                mode,
                ..ProcessorSettings::default()
            },
        ));

        let (trigger, shutdown) = shutdown::channel();
        let workers = consumers::spawn_all(&bus, processor.clone(), fast_retries(), shutdown)
            .await
            .unwrap();

        Self {
            processor,
            store,
            gateway,
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

pub fn order_created(order_id: Uuid) -> OrderCreatedEvent {
    OrderCreatedEvent {
        order_id: order_id.to_string(),
        user_id: Uuid::new_v4().to_string(),
        amount: 20.0,
        currency: "usd".to_string(),
        payment_method_id: String::new(),
    }
}

pub async fn announce(bus: &InMemoryBus, event: &OrderCreatedEvent) {
    publish_json(bus, ORDER_EVENTS_EXCHANGE, ORDER_CREATED, event).await.unwrap();
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
