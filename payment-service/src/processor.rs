//! Payment side of the saga: turns `order.created` into a payment attempt
//! and reports the outcome as `payment.success` or `payment.failed`.
//!
//! Every step persists before it publishes, so a crash in between leaves the
//! stored payment ahead of the event stream. Redelivery of `order.created`
//! re-publishes the stored outcome instead of charging twice.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use clap::ValueEnum;
use num_traits::FromPrimitive;
use shared::{
    parse_order_id, publish_json, EventBus, HandlerError, OrderCreatedEvent, PaymentCheckoutCreatedEvent,
    PaymentFailedEvent, PaymentSuccessEvent, PublishError, RepositoryError, PAYMENT_CHECKOUT_CREATED,
    PAYMENT_EVENTS_EXCHANGE, PAYMENT_FAILED, PAYMENT_SUCCESS,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::gateway::{CheckoutRequest, GatewayError, IntentRequest, PaymentGateway};
use crate::models::{wire_amount, NewPayment, Payment, PaymentStatus, Resolution};
use crate::store::PaymentStore;

pub const CHECKOUT_EXPIRED: &str = "checkout_expired";
pub const CHECKOUT_SESSION_FAILED: &str = "checkout_session_failed";
pub const GATEWAY_ERROR: &str = "gateway_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PaymentMode {
    /// Create and confirm a payment intent right away.
    Charge,
    /// Hand the customer a hosted checkout page and wait for the webhook.
    Checkout,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub mode: PaymentMode,
    pub default_currency: String,
    /// Used when the order carries no payment method.
    pub default_payment_method: String,
    pub product_name: String,
    /// Advertised lifetime of a checkout link; matches the order timeout.
    pub checkout_ttl: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            mode: PaymentMode::Checkout,
            default_currency: "usd".to_string(),
            default_payment_method: "pm_card_visa".to_string(),
            product_name: "Food Order".to_string(),
            checkout_ttl: Duration::from_secs(300),
        }
    }
}

/// The parts of a checkout session webhook the processor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionUpdate {
    pub session_id: String,
    pub order_id: Option<String>,
    pub payment_intent_id: Option<String>,
}

pub struct PaymentProcessor {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    bus: Arc<dyn EventBus>,
    settings: ProcessorSettings,
}

impl PaymentProcessor {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<dyn EventBus>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            bus,
            settings,
        }
    }

    pub async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Payment>, RepositoryError> {
        self.store.find_by_order_id(order_id).await
    }

    pub async fn process_order_created(&self, event: OrderCreatedEvent) -> Result<(), HandlerError> {
        let order_id = parse_order_id(&event.order_id)?;
        let user_id = Uuid::parse_str(&event.user_id)
            .map_err(|_| HandlerError::InvalidEvent(format!("malformed user id {:?}", event.user_id)))?;
        let amount = BigDecimal::from_f64(event.amount)
            .filter(|_| event.amount >= 0.0)
            .ok_or_else(|| HandlerError::InvalidEvent(format!("invalid amount {}", event.amount)))?
            .round(2);

        let payment = match self.store.find_by_order_id(order_id).await? {
            Some(existing) => match existing.status() {
                Ok(PaymentStatus::Pending) => {
                    info!(%order_id, payment_id = %existing.id, "resuming pending payment");
                    existing
                }
                _ => {
                    info!(%order_id, status = %existing.status, "payment already resolved, re-publishing outcome");
                    return self.publish_outcome(&existing).await;
                }
            },
            None => {
                let currency = if event.currency.is_empty() {
                    self.settings.default_currency.clone()
                } else {
                    event.currency.to_lowercase()
                };
                let payment = self
                    .store
                    .create(NewPayment {
                        id: Uuid::new_v4(),
                        order_id,
                        user_id,
                        amount,
                        currency,
                        status: PaymentStatus::Pending.as_str().to_string(),
                        payment_method_id: Some(event.payment_method_id).filter(|id| !id.is_empty()),
                    })
                    .await?;
                info!(
                    %order_id,
                    payment_id = %payment.id,
                    amount = event.amount,
                    currency = %payment.currency,
                    "payment created"
                );
                payment
            }
        };

        match self.settings.mode {
            PaymentMode::Charge => self.charge(payment).await,
            PaymentMode::Checkout => self.start_checkout(payment).await,
        }
    }

    /// Synchronous create-and-confirm. The payment id doubles as the
    /// gateway idempotency key so a resumed attempt never charges twice.
    async fn charge(&self, payment: Payment) -> Result<(), HandlerError> {
        let resolution = match self.run_charge(&payment).await {
            Ok(resolution) => resolution,
            Err(GatewayError::Declined { code, reason }) => Resolution::failed(&code, reason),
            Err(e) => {
                warn!(order_id = %payment.order_id, error = %e, "gateway call failed");
                Resolution::failed(GATEWAY_ERROR, e.to_string())
            }
        };
        self.resolve(&payment, resolution).await
    }

    async fn run_charge(&self, payment: &Payment) -> Result<Resolution, GatewayError> {
        let payment_method = payment
            .payment_method_id
            .clone()
            .unwrap_or_else(|| self.settings.default_payment_method.clone());

        let intent = self
            .gateway
            .create_payment_intent(&IntentRequest {
                order_id: payment.order_id,
                amount: payment.amount.clone(),
                currency: payment.currency.clone(),
                payment_method_id: None,
                idempotency_key: payment.id.to_string(),
            })
            .await?;
        if let Err(e) = self.store.set_intent(payment.id, &intent.id).await {
            warn!(payment_id = %payment.id, error = %e, "failed to record payment intent");
        }

        let mut intent = if intent.is_succeeded() {
            intent
        } else {
            self.gateway
                .confirm_payment_intent(&intent.id, &payment_method, &format!("{}-confirm", payment.id))
                .await?
        };
        if intent.is_in_progress() {
            intent = self.gateway.get_payment_intent(&intent.id).await?;
        }

        if intent.is_succeeded() {
            return Ok(Resolution::Succeeded {
                intent_id: Some(intent.id),
                charge_id: intent.latest_charge,
            });
        }
        let (code, reason) = match intent.last_payment_error {
            Some(error) => (
                error.decline_code.or(error.code).unwrap_or_else(|| intent.status.clone()),
                error.message.unwrap_or_default(),
            ),
            None => (intent.status.clone(), format!("payment intent ended in status {}", intent.status)),
        };
        Ok(Resolution::failed(&code, reason))
    }

    async fn start_checkout(&self, payment: Payment) -> Result<(), HandlerError> {
        if let Some(session_id) = &payment.checkout_session_id {
            info!(order_id = %payment.order_id, %session_id, "checkout session already exists");
            return Ok(());
        }

        let session = match self
            .gateway
            .create_checkout_session(&CheckoutRequest {
                order_id: payment.order_id,
                amount: payment.amount.clone(),
                currency: payment.currency.clone(),
                product_name: self.settings.product_name.clone(),
                idempotency_key: payment.id.to_string(),
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(order_id = %payment.order_id, error = %e, "failed to create checkout session");
                return self
                    .resolve(&payment, Resolution::failed(CHECKOUT_SESSION_FAILED, e.to_string()))
                    .await;
            }
        };

        let payment = self
            .store
            .set_checkout_session(payment.id, &session.id, &session.url)
            .await?;

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.settings.checkout_ttl)
            .map(|ttl| now + ttl)
            .unwrap_or(now);
        let event = PaymentCheckoutCreatedEvent {
            order_id: payment.order_id.to_string(),
            user_id: payment.user_id.to_string(),
            amount: wire_amount(&payment.amount),
            currency: payment.currency.clone(),
            checkout_url: session.url.clone(),
            session_id: session.id.clone(),
            expires_at,
            timestamp: now,
        };
        if let Err(e) = publish_json(self.bus.as_ref(), PAYMENT_EVENTS_EXCHANGE, PAYMENT_CHECKOUT_CREATED, &event).await
        {
            warn!(order_id = %payment.order_id, error = %e, "failed to publish payment.checkout.created");
        }

        info!(order_id = %payment.order_id, session_id = %session.id, "checkout session created");
        Ok(())
    }

    /// `checkout.session.completed`: the customer paid.
    pub async fn handle_checkout_completed(&self, update: CheckoutSessionUpdate) -> Result<(), HandlerError> {
        let payment = self.payment_for_session(&update).await?;
        match payment.status() {
            Ok(PaymentStatus::Pending) => {
                let intent_id = update.payment_intent_id.or_else(|| payment.gateway_intent_id.clone());
                self.resolve(
                    &payment,
                    Resolution::Succeeded {
                        intent_id,
                        charge_id: None,
                    },
                )
                .await
            }
            Ok(PaymentStatus::Success) => self.publish_outcome(&payment).await,
            _ => {
                warn!(
                    order_id = %payment.order_id,
                    status = %payment.status,
                    session_id = %update.session_id,
                    "checkout completed for a payment that is no longer pending"
                );
                Ok(())
            }
        }
    }

    /// `checkout.session.expired`: the link lapsed unpaid.
    pub async fn handle_checkout_expired(&self, update: CheckoutSessionUpdate) -> Result<(), HandlerError> {
        let payment = self.payment_for_session(&update).await?;
        if payment.status != PaymentStatus::Pending.as_str() {
            return Ok(());
        }
        self.resolve(
            &payment,
            Resolution::Failed {
                status: PaymentStatus::Expired,
                code: CHECKOUT_EXPIRED.to_string(),
                reason: "Checkout session expired".to_string(),
            },
        )
        .await
    }

    async fn payment_for_session(&self, update: &CheckoutSessionUpdate) -> Result<Payment, HandlerError> {
        if let Some(payment) = self.store.find_by_checkout_session(&update.session_id).await? {
            return Ok(payment);
        }
        let Some(order_id) = update.order_id.as_deref() else {
            return Err(HandlerError::NotFound(format!("payment for session {}", update.session_id)));
        };
        let order_id = parse_order_id(order_id)?;
        self.store
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| HandlerError::NotFound(format!("payment for order {order_id}")))
    }

    /// Persists the outcome, then publishes it. When the payment was resolved
    /// concurrently, the stored outcome is published instead.
    async fn resolve(&self, payment: &Payment, resolution: Resolution) -> Result<(), HandlerError> {
        let resolved = match self.store.resolve(payment.id, &resolution).await? {
            Some(resolved) => resolved,
            None => self
                .store
                .find_by_order_id(payment.order_id)
                .await?
                .ok_or_else(|| HandlerError::NotFound(format!("payment {}", payment.id)))?,
        };
        info!(order_id = %resolved.order_id, status = %resolved.status, "payment resolved");
        self.publish_outcome(&resolved).await
    }

    async fn publish_outcome(&self, payment: &Payment) -> Result<(), HandlerError> {
        let published = match payment.status() {
            Ok(PaymentStatus::Success) => {
                let event = PaymentSuccessEvent {
                    order_id: payment.order_id.to_string(),
                    user_id: payment.user_id.to_string(),
                    amount: wire_amount(&payment.amount),
                    currency: payment.currency.clone(),
                    gateway_intent_id: payment.gateway_intent_id.clone().unwrap_or_default(),
                    gateway_charge_id: payment.gateway_charge_id.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                };
                self.publish(PAYMENT_SUCCESS, &event).await
            }
            Ok(PaymentStatus::Failed | PaymentStatus::Expired) => {
                let event = PaymentFailedEvent {
                    order_id: payment.order_id.to_string(),
                    customer_id: payment.user_id.to_string(),
                    payment_id: payment.id.to_string(),
                    failure_reason: payment.failure_reason.clone().unwrap_or_default(),
                    failure_code: payment.failure_code.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                };
                self.publish(PAYMENT_FAILED, &event).await
            }
            Ok(PaymentStatus::Pending) => Ok(()),
            Err(e) => return Err(HandlerError::InvalidEvent(e.to_string())),
        };
        Ok(published?)
    }

    async fn publish<T: serde::Serialize + Sync>(&self, routing_key: &str, event: &T) -> Result<(), PublishError> {
        publish_json(self.bus.as_ref(), PAYMENT_EVENTS_EXCHANGE, routing_key, event).await
    }
}
