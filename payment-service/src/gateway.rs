//! Payment gateway capability plus the Stripe REST and simulated backends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::minor_units;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The card network refused the charge. A business outcome, not a fault.
    #[error("payment declined ({code}): {reason}")]
    Declined { code: String, reason: String },

    #[error("gateway unreachable: {0}")]
    Transport(String),

    #[error("gateway returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid gateway request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub order_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_method_id: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub order_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub product_name: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayErrorBody {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub last_payment_error: Option<GatewayErrorBody>,
}

impl PaymentIntent {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == "processing"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError>;

    async fn create_payment_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError>;

    async fn confirm_payment_intent(
        &self,
        intent_id: &str,
        payment_method_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn get_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub api_base: String,
    pub success_url: String,
    pub cancel_url: String,
    pub timeout: Duration,
}

impl StripeSettings {
    /// Redirect targets on the storefront at `redirect_base`.
    pub fn with_redirects(secret_key: String, api_base: &str, redirect_base: &str, timeout: Duration) -> Self {
        let redirect_base = redirect_base.trim_end_matches('/');
        Self {
            secret_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            success_url: format!("{redirect_base}/payment/success?session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{redirect_base}/payment/cancel"),
            timeout,
        }
    }
}

/// Stripe's form-encoded REST API.
pub struct StripeGateway {
    settings: StripeSettings,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct StripeErrorEnvelope {
    error: GatewayErrorBody,
}

#[derive(Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
    expires_at: Option<i64>,
}

impl StripeGateway {
    pub fn new(settings: StripeSettings) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { settings, client })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
        idempotency_key: &str,
    ) -> Result<T, GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.settings.api_base, path))
            .bearer_auth(&self.settings.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| GatewayError::Api {
                status: status.as_u16(),
                message: format!("undecodable response: {e}"),
            });
        }

        let error = serde_json::from_slice::<StripeErrorEnvelope>(&body)
            .map(|envelope| envelope.error)
            .unwrap_or(GatewayErrorBody {
                kind: None,
                code: None,
                decline_code: None,
                message: Some(String::from_utf8_lossy(&body).into_owned()),
            });
        Err(classify_error(status.as_u16(), error))
    }
}

/// Card errors become [`GatewayError::Declined`]; everything else is an API fault.
pub fn classify_error(status: u16, error: GatewayErrorBody) -> GatewayError {
    let message = error.message.unwrap_or_else(|| "unknown error".to_string());
    if error.kind.as_deref() == Some("card_error") {
        let code = error
            .decline_code
            .or(error.code)
            .unwrap_or_else(|| "card_declined".to_string());
        return GatewayError::Declined { code, reason: message };
    }
    GatewayError::Api { status, message }
}

fn amount_param(amount: &BigDecimal) -> Result<String, GatewayError> {
    minor_units(amount)
        .filter(|cents| *cents >= 0)
        .map(|cents| cents.to_string())
        .ok_or_else(|| GatewayError::InvalidRequest(format!("amount {amount} is not chargeable")))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError> {
        let order_id = request.order_id.to_string();
        let form = [
            ("mode", "payment".to_string()),
            ("payment_method_types[0]", "card".to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", request.currency.clone()),
            ("line_items[0][price_data][unit_amount]", amount_param(&request.amount)?),
            ("line_items[0][price_data][product_data][name]", request.product_name.clone()),
            ("success_url", self.settings.success_url.clone()),
            ("cancel_url", self.settings.cancel_url.clone()),
            ("client_reference_id", order_id.clone()),
            ("metadata[order_id]", order_id),
        ];
        let session: StripeCheckoutSession = self
            .post("/v1/checkout/sessions", &form, &request.idempotency_key)
            .await?;

        let url = session.url.ok_or_else(|| GatewayError::Api {
            status: 200,
            message: format!("checkout session {} has no url", session.id),
        })?;
        Ok(CheckoutSession {
            id: session.id,
            url,
            expires_at: session
                .expires_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        })
    }

    async fn create_payment_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let mut form = vec![
            ("amount", amount_param(&request.amount)?),
            ("currency", request.currency.clone()),
            ("metadata[order_id]", request.order_id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("automatic_payment_methods[allow_redirects]", "never".to_string()),
        ];
        if let Some(method) = &request.payment_method_id {
            form.push(("payment_method", method.clone()));
        }
        self.post("/v1/payment_intents", &form, &request.idempotency_key).await
    }

    async fn confirm_payment_intent(
        &self,
        intent_id: &str,
        payment_method_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let form = [("payment_method", payment_method_id.to_string())];
        self.post(&format!("/v1/payment_intents/{intent_id}/confirm"), &form, idempotency_key)
            .await
    }

    async fn get_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{intent_id}", self.settings.api_base))
            .bearer_auth(&self.settings.secret_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Self::decode(response).await
    }
}

/// Idempotency keys remembered before resolved intents are pruned.
const SIMULATED_CAPACITY: usize = 10_000;

/// Gateway stand-in for local runs without Stripe credentials. Confirmation
/// succeeds with probability `success_rate`.
pub struct SimulatedGateway {
    success_rate: f64,
    checkout_base_url: String,
    session_ttl: Duration,
    capacity: usize,
    intents: Mutex<HashMap<String, PaymentIntent>>,
    keys: Mutex<HashMap<String, String>>,
}

impl SimulatedGateway {
    pub fn new(success_rate: f64, checkout_base_url: &str, session_ttl: Duration) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            checkout_base_url: checkout_base_url.trim_end_matches('/').to_string(),
            session_ttl,
            capacity: SIMULATED_CAPACITY,
            intents: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Forgets resolved intents and every key not pointing at a pending one.
    fn prune(&self) {
        let mut intents = self.intents.lock().unwrap_or_else(|p| p.into_inner());
        intents.retain(|_, intent| !intent.is_succeeded() && intent.last_payment_error.is_none());
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.retain(|_, id| intents.contains_key(id));
        debug!(remaining = keys.len(), "pruned simulated gateway state");
    }

    fn simulated_id(prefix: &str) -> String {
        format!("{prefix}_sim_{}", Uuid::new_v4().simple())
    }

    fn store(&self, intent: &PaymentIntent) {
        self.intents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(intent.id.clone(), intent.clone());
    }

    fn lookup(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        self.intents
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(intent_id)
            .cloned()
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("no such payment_intent: {intent_id}"),
            })
    }

    /// Same idempotency key, same object id.
    fn id_for_key(&self, key: &str, prefix: &str) -> (String, bool) {
        if self.tracked_keys() >= self.capacity {
            self.prune();
        }
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        match keys.get(key) {
            Some(id) => (id.clone(), true),
            None => {
                let id = Self::simulated_id(prefix);
                keys.insert(key.to_string(), id.clone());
                (id, false)
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError> {
        amount_param(&request.amount)?;
        let (id, _) = self.id_for_key(&request.idempotency_key, "cs");
        let expires_at = chrono::Duration::from_std(self.session_ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        Ok(CheckoutSession {
            url: format!("{}/{}", self.checkout_base_url, id),
            id,
            expires_at,
        })
    }

    async fn create_payment_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        amount_param(&request.amount)?;
        let (id, existing) = self.id_for_key(&request.idempotency_key, "pi");
        if existing {
            return self.lookup(&id);
        }
        let intent = PaymentIntent {
            id,
            status: "requires_confirmation".to_string(),
            latest_charge: None,
            last_payment_error: None,
        };
        self.store(&intent);
        Ok(intent)
    }

    async fn confirm_payment_intent(
        &self,
        intent_id: &str,
        _payment_method_id: &str,
        _idempotency_key: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut intent = self.lookup(intent_id)?;
        if intent.is_succeeded() {
            return Ok(intent);
        }
        if rand::random::<f64>() < self.success_rate {
            intent.status = "succeeded".to_string();
            intent.latest_charge = Some(Self::simulated_id("ch"));
            self.store(&intent);
            debug!(intent_id, "simulated charge succeeded");
            Ok(intent)
        } else {
            intent.status = "requires_payment_method".to_string();
            let error = GatewayErrorBody {
                kind: Some("card_error".to_string()),
                code: Some("card_declined".to_string()),
                decline_code: Some("generic_decline".to_string()),
                message: Some("Your card was declined.".to_string()),
            };
            intent.last_payment_error = Some(error.clone());
            self.store(&intent);
            debug!(intent_id, "simulated charge declined");
            Err(classify_error(402, error))
        }
    }

    async fn get_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        self.lookup(intent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent_request() -> IntentRequest {
        IntentRequest {
            order_id: Uuid::new_v4(),
            amount: "20.00".parse().unwrap(),
            currency: "usd".to_string(),
            payment_method_id: None,
            idempotency_key: Uuid::new_v4().to_string(),
        }
    }

    #[test]
    fn test_card_errors_are_declines() {
        let err = classify_error(
            402,
            GatewayErrorBody {
                kind: Some("card_error".to_string()),
                code: Some("card_declined".to_string()),
                decline_code: Some("insufficient_funds".to_string()),
                message: Some("Your card has insufficient funds.".to_string()),
            },
        );
        assert!(matches!(err, GatewayError::Declined { ref code, .. } if code == "insufficient_funds"));

        let err = classify_error(
            401,
            GatewayErrorBody {
                kind: Some("invalid_request_error".to_string()),
                code: None,
                decline_code: None,
                message: Some("Invalid API Key provided".to_string()),
            },
        );
        assert!(matches!(err, GatewayError::Api { status: 401, .. }));
    }

    #[test]
    fn test_intent_deserializes_from_stripe_json() {
        let json = r#"{"id":"pi_123","object":"payment_intent","status":"succeeded","latest_charge":"ch_123","amount":2000}"#;
        let intent: PaymentIntent = serde_json::from_str(json).unwrap();
        assert!(intent.is_succeeded());
        assert_eq!(intent.latest_charge.as_deref(), Some("ch_123"));
    }

    #[tokio::test]
    async fn test_simulated_gateway_outcomes_follow_success_rate() {
        let always = SimulatedGateway::new(1.0, "http://localhost/checkout", Duration::from_secs(300));
        let intent = always.create_payment_intent(&intent_request()).await.unwrap();
        let confirmed = always.confirm_payment_intent(&intent.id, "pm_card_visa", "k").await.unwrap();
        assert!(confirmed.is_succeeded());
        assert!(always.get_payment_intent(&intent.id).await.unwrap().is_succeeded());

        let never = SimulatedGateway::new(0.0, "http://localhost/checkout", Duration::from_secs(300));
        let intent = never.create_payment_intent(&intent_request()).await.unwrap();
        let err = never.confirm_payment_intent(&intent.id, "pm_card_visa", "k").await.unwrap_err();
        assert!(matches!(err, GatewayError::Declined { .. }));
    }

    #[tokio::test]
    async fn test_simulated_gateway_prunes_resolved_intents() {
        let gateway = SimulatedGateway::new(1.0, "http://localhost/checkout", Duration::from_secs(300)).with_capacity(2);
        for _ in 0..2 {
            let intent = gateway.create_payment_intent(&intent_request()).await.unwrap();
            gateway.confirm_payment_intent(&intent.id, "pm_card_visa", "k").await.unwrap();
        }
        assert_eq!(gateway.tracked_keys(), 2);

        let pending = gateway.create_payment_intent(&intent_request()).await.unwrap();
        assert_eq!(gateway.tracked_keys(), 1);
        assert_eq!(gateway.get_payment_intent(&pending.id).await.unwrap().status, "requires_confirmation");
    }

    #[tokio::test]
    async fn test_simulated_intent_creation_is_idempotent() {
        let gateway = SimulatedGateway::new(1.0, "http://localhost/checkout", Duration::from_secs(300));
        let request = intent_request();
        let first = gateway.create_payment_intent(&request).await.unwrap();
        let second = gateway.create_payment_intent(&request).await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
