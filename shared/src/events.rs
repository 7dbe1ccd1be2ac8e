use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HandlerError;

pub const ORDER_EVENTS_EXCHANGE: &str = "order.events";
pub const PAYMENT_EVENTS_EXCHANGE: &str = "payment.events";

pub const ORDER_CREATED: &str = "order.created";
pub const PAYMENT_SUCCESS: &str = "payment.success";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PAYMENT_TIMEOUT: &str = "payment.timeout";
pub const PAYMENT_CHECKOUT_CREATED: &str = "payment.checkout.created";

/// Queues owned by payment-service.
pub mod payment_queues {
    pub const ORDER_CREATED: &str = "payment.order.created";
}

/// Queues owned by order-service.
pub mod order_queues {
    pub const PAYMENT_SUCCESS: &str = "order.payment.success";
    pub const PAYMENT_FAILED: &str = "order.payment.failed";
    pub const PAYMENT_TIMEOUT: &str = "order.payment.timeout";
    pub const PAYMENT_TIMEOUT_DELAY: &str = "order.payment.timeout.delay";
}

/// Parses the order id carried by an event. A malformed id is permanent.
pub fn parse_order_id(raw: &str) -> Result<Uuid, HandlerError> {
    Uuid::parse_str(raw).map_err(|_| HandlerError::InvalidEvent(format!("malformed order id {raw:?}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub payment_method_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSuccessEvent {
    pub order_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub gateway_intent_id: String,
    #[serde(default)]
    pub gateway_charge_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailedEvent {
    pub order_id: String,
    pub customer_id: String,
    pub payment_id: String,
    pub failure_reason: String,
    pub failure_code: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTimeoutEvent {
    pub order_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCheckoutCreatedEvent {
    pub order_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub checkout_url: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}
