//! Order side of the payment saga.
//!
//! `create_order` persists a PENDING order, announces it with `order.created`
//! and parks a timeout check in the delay queue. The payment outcome events
//! then move the order to CONFIRMED, PAYMENT_FAILED or CANCELLED.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use num_traits::FromPrimitive;
use serde::Deserialize;
use shared::{
    parse_order_id, publish_json, EventBus, HandlerError, OrderCreatedEvent, PaymentFailedEvent, PaymentSuccessEvent,
    PaymentTimeoutEvent, RepositoryError, TimeoutScheduler, ORDER_CREATED, ORDER_EVENTS_EXCHANGE,
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogError, FoodCatalog};
use crate::models::{wire_amount, NewOrder, OrderDetails, OrderItem, OrderStatus};
use crate::store::OrderStore;

#[derive(Debug, Clone, Deserialize)]
pub struct OrderItemRequest {
    pub food_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub user_id: Uuid,
    pub order_items: Vec<OrderItemRequest>,
    #[serde(default)]
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order must contain at least one item")]
    EmptyOrder,

    #[error("quantity for food {food_id} must be at least 1, got {quantity}")]
    InvalidQuantity { food_id: Uuid, quantity: i32 },

    #[error("food {0} does not exist")]
    UnknownFood(Uuid),

    #[error(transparent)]
    Catalog(CatalogError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<CatalogError> for OrderError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => OrderError::UnknownFood(id),
            other => OrderError::Catalog(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SagaSettings {
    pub currency: String,
    pub payment_timeout: Duration,
}

pub struct OrderSaga {
    store: Arc<dyn OrderStore>,
    catalog: Arc<dyn FoodCatalog>,
    bus: Arc<dyn EventBus>,
    timeouts: TimeoutScheduler,
    settings: SagaSettings,
}

impl OrderSaga {
    pub fn new(
        store: Arc<dyn OrderStore>,
        catalog: Arc<dyn FoodCatalog>,
        bus: Arc<dyn EventBus>,
        timeouts: TimeoutScheduler,
        settings: SagaSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            bus,
            timeouts,
            settings,
        }
    }

    pub async fn create_order(&self, request: CreateOrder) -> Result<OrderDetails, OrderError> {
        if request.order_items.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        if let Some(item) = request.order_items.iter().find(|item| item.quantity < 1) {
            return Err(OrderError::InvalidQuantity {
                food_id: item.food_id,
                quantity: item.quantity,
            });
        }

        let order_id = Uuid::new_v4();
        let mut items = Vec::with_capacity(request.order_items.len());
        for item in &request.order_items {
            let food = self.catalog.get_food(item.food_id).await?;
            let price = BigDecimal::from_f64(food.price)
                .ok_or_else(|| CatalogError::InvalidResponse(format!("food {} has price {}", food.id, food.price)))?
                .round(2);
            items.push(OrderItem {
                id: Uuid::new_v4(),
                order_id,
                food_id: item.food_id,
                quantity: item.quantity,
                price,
            });
        }
        let total_amount: BigDecimal = items.iter().map(OrderItem::line_total).sum();

        let payment_method_id = request.payment_method_id.filter(|id| !id.is_empty());
        let order = self
            .store
            .create(
                NewOrder {
                    id: order_id,
                    user_id: request.user_id,
                    status: OrderStatus::Pending.as_str().to_string(),
                    total_amount,
                    currency: self.settings.currency.clone(),
                    payment_method_id,
                },
                items,
            )
            .await?;

        let event = OrderCreatedEvent {
            order_id: order_id.to_string(),
            user_id: order.order.user_id.to_string(),
            amount: wire_amount(&order.order.total_amount),
            currency: order.order.currency.clone(),
            payment_method_id: order.order.payment_method_id.clone().unwrap_or_default(),
        };
        // The order stays PENDING; the timeout below cancels it if no payment
        // event ever arrives.
        if let Err(e) = publish_json(self.bus.as_ref(), ORDER_EVENTS_EXCHANGE, ORDER_CREATED, &event).await {
            error!(%order_id, error = %e, "order persisted but order.created was not published");
        }

        if let Err(e) = self
            .timeouts
            .schedule_timeout(order_id, self.settings.payment_timeout)
            .await
        {
            warn!(%order_id, error = %e, "failed to schedule payment timeout");
        }

        info!(%order_id, user_id = %order.order.user_id, amount = event.amount, "order created");
        Ok(order)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<OrderDetails>, RepositoryError> {
        self.store.find_by_id(id).await
    }

    pub async fn on_payment_success(&self, event: PaymentSuccessEvent) -> Result<(), HandlerError> {
        let order_id = parse_order_id(&event.order_id)?;
        self.resolve(order_id, OrderStatus::Confirmed).await?;
        info!(%order_id, intent = %event.gateway_intent_id, "order confirmed");
        Ok(())
    }

    pub async fn on_payment_failed(&self, event: PaymentFailedEvent) -> Result<(), HandlerError> {
        let order_id = parse_order_id(&event.order_id)?;
        self.resolve(order_id, OrderStatus::PaymentFailed).await?;
        info!(
            %order_id,
            failure_code = %event.failure_code,
            reason = %event.failure_reason,
            "order payment failed"
        );
        Ok(())
    }

    /// Cancels the order if it is still waiting for payment. A resolved
    /// order is left alone.
    pub async fn on_payment_timeout(&self, event: PaymentTimeoutEvent) -> Result<(), HandlerError> {
        let order_id = parse_order_id(&event.order_id)?;
        let details = self
            .store
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| HandlerError::NotFound(format!("order {order_id}")))?;

        if details.order.status != OrderStatus::Pending.as_str() {
            info!(%order_id, status = %details.order.status, "payment timeout ignored, order already resolved");
            return Ok(());
        }

        let cancelled = self
            .store
            .update_status_if(order_id, OrderStatus::Pending, OrderStatus::Cancelled)
            .await?;
        if cancelled {
            info!(%order_id, scheduled_at = %event.created_at, "order cancelled after payment timeout");
        } else {
            info!(%order_id, "payment resolved while the timeout was handled");
        }
        Ok(())
    }

    /// Applied unconditionally so a redelivered outcome rewrites the same value.
    async fn resolve(&self, order_id: Uuid, status: OrderStatus) -> Result<(), HandlerError> {
        if !self.store.update_status(order_id, status).await? {
            return Err(HandlerError::NotFound(format!("order {order_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryFoodCatalog;
    use crate::consumers;
    use crate::store::InMemoryOrderStore;
    use chrono::Utc;
    use shared::{payment_timeout_queue, InMemoryBus};

    struct Fixture {
        saga: OrderSaga,
        store: Arc<InMemoryOrderStore>,
        catalog: Arc<InMemoryFoodCatalog>,
        bus: InMemoryBus,
    }

    async fn fixture() -> Fixture {
        let bus = InMemoryBus::new();
        let timeouts = TimeoutScheduler::new(
            Arc::new(bus.clone()),
            payment_timeout_queue(Duration::from_secs(60)),
        );
        bus.declare_topology(&consumers::topology(timeouts.queue()))
            .await
            .unwrap();
        let store = Arc::new(InMemoryOrderStore::new());
        let catalog = Arc::new(InMemoryFoodCatalog::new());
        let saga = OrderSaga::new(
            store.clone(),
            catalog.clone(),
            Arc::new(bus.clone()),
            timeouts,
            SagaSettings {
                currency: "usd".to_string(),
                payment_timeout: Duration::from_secs(60),
            },
        );
        Fixture {
            saga,
            store,
            catalog,
            bus,
        }
    }

    fn request(items: Vec<(Uuid, i32)>) -> CreateOrder {
        CreateOrder {
            user_id: Uuid::new_v4(),
            order_items: items
                .into_iter()
                .map(|(food_id, quantity)| OrderItemRequest { food_id, quantity })
                .collect(),
            payment_method_id: None,
        }
    }

    #[tokio::test]
    async fn test_total_is_sum_of_priced_items() {
        let f = fixture().await;
        let (pizza, soda) = (Uuid::new_v4(), Uuid::new_v4());
        f.catalog.insert(pizza, "pizza", 12.5);
        f.catalog.insert(soda, "soda", 1.99);

        let details = f.saga.create_order(request(vec![(pizza, 2), (soda, 3)])).await.unwrap();

        assert_eq!(details.order.total_amount, "30.97".parse::<BigDecimal>().unwrap());
        assert_eq!(details.items_total(), details.order.total_amount);
        assert_eq!(details.order.status().unwrap(), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let f = fixture().await;
        let food = Uuid::new_v4();
        f.catalog.insert(food, "pizza", 10.0);

        assert!(matches!(
            f.saga.create_order(request(vec![])).await,
            Err(OrderError::EmptyOrder)
        ));
        assert!(matches!(
            f.saga.create_order(request(vec![(food, 0)])).await,
            Err(OrderError::InvalidQuantity { quantity: 0, .. })
        ));
        let missing = Uuid::new_v4();
        assert!(matches!(
            f.saga.create_order(request(vec![(missing, 1)])).await,
            Err(OrderError::UnknownFood(id)) if id == missing
        ));
        assert!(f.bus.published::<OrderCreatedEvent>(ORDER_CREATED).is_empty());
    }

    #[tokio::test]
    async fn test_catalog_outage_is_not_an_unknown_food() {
        let f = fixture().await;
        let food = Uuid::new_v4();
        f.catalog.insert(food, "pizza", 10.0);
        f.catalog.set_unavailable(true);

        let err = f.saga.create_order(request(vec![(food, 1)])).await.unwrap_err();
        assert!(matches!(err, OrderError::Catalog(CatalogError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_order_is_kept_when_publish_fails() {
        let f = fixture().await;
        let food = Uuid::new_v4();
        f.catalog.insert(food, "pizza", 10.0);
        f.bus.set_connected(false);

        let details = f.saga.create_order(request(vec![(food, 1)])).await.unwrap();

        let stored = f.store.find_by_id(details.order.id).await.unwrap().unwrap();
        assert_eq!(stored.order.status().unwrap(), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_payment_failed_marks_order() {
        let f = fixture().await;
        let food = Uuid::new_v4();
        f.catalog.insert(food, "pizza", 10.0);
        let details = f.saga.create_order(request(vec![(food, 1)])).await.unwrap();

        f.saga
            .on_payment_failed(PaymentFailedEvent {
                order_id: details.order.id.to_string(),
                customer_id: details.order.user_id.to_string(),
                payment_id: Uuid::new_v4().to_string(),
                failure_reason: "Your card was declined.".to_string(),
                failure_code: "card_declined".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let stored = f.store.find_by_id(details.order.id).await.unwrap().unwrap();
        assert_eq!(stored.order.status().unwrap(), OrderStatus::PaymentFailed);
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_order_is_permanent() {
        let f = fixture().await;
        let err = f
            .saga
            .on_payment_success(PaymentSuccessEvent {
                order_id: Uuid::new_v4().to_string(),
                user_id: Uuid::new_v4().to_string(),
                amount: 10.0,
                currency: "usd".to_string(),
                gateway_intent_id: "pi_1".to_string(),
                gateway_charge_id: String::new(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let f = fixture().await;
        f.store.set_unavailable(true);
        let err = f
            .saga
            .on_payment_timeout(PaymentTimeoutEvent {
                order_id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
