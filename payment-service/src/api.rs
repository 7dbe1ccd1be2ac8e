use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use shared::RepositoryError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{wire_amount, Payment};
use crate::processor::PaymentProcessor;
use crate::webhook::{self, CHECKOUT_SESSION_COMPLETED, CHECKOUT_SESSION_EXPIRED};

const WEBHOOK_BODY_LIMIT: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<PaymentProcessor>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub order_id: Uuid,
    pub status: String,
    pub amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Payment> for PaymentStatusResponse {
    fn from(payment: Payment) -> Self {
        Self {
            order_id: payment.order_id,
            amount: wire_amount(&payment.amount),
            status: payment.status,
            currency: payment.currency,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub checkout_url: String,
    pub status: String,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        error!(error = %err, "payment store failure");
        match err {
            RepositoryError::Unavailable(_) => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "payment store unavailable"),
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/payments/:order_id/status", get(payment_status))
        .route("/payments/:order_id/checkout", get(checkout_url))
        .route(
            "/webhook/stripe",
            post(stripe_webhook).layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        )
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn find_payment(state: &AppState, order_id: &str) -> Result<Payment, ApiError> {
    let order_id =
        Uuid::parse_str(order_id).map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid order ID"))?;
    state
        .processor
        .find_by_order_id(order_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "payment not found"))
}

pub async fn payment_status(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<PaymentStatusResponse>, ApiError> {
    let payment = find_payment(&state, &order_id).await?;
    Ok(Json(payment.into()))
}

pub async fn checkout_url(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let payment = find_payment(&state, &order_id).await?;
    let Some(url) = payment.checkout_url.clone() else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "checkout session not created yet"));
    };
    Ok(Json(CheckoutResponse {
        order_id: payment.order_id,
        checkout_url: url,
        amount: wire_amount(&payment.amount),
        status: payment.status,
        currency: payment.currency,
    }))
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    match &state.webhook_secret {
        Some(secret) => {
            let verified = headers
                .get("stripe-signature")
                .and_then(|value| value.to_str().ok())
                .ok_or(webhook::WebhookError::MissingSignature)
                .and_then(|header| webhook::verify_signature(&body, header, secret, Utc::now().timestamp()));
            if let Err(e) = verified {
                warn!(error = %e, "rejected webhook");
                return Err(ApiError::new(StatusCode::BAD_REQUEST, e.to_string()));
            }
        }
        None => warn!("STRIPE_WEBHOOK_SECRET not set, accepting unsigned webhook"),
    }

    let event = webhook::parse_event(&body).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(event_id = %event.id, event_type = %event.event_type, "webhook received");

    match event.event_type.as_str() {
        CHECKOUT_SESSION_COMPLETED => {
            let session = event
                .checkout_session()
                .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
            if let Err(e) = state.processor.handle_checkout_completed(session).await {
                error!(event_id = %event.id, error = %e, "failed to process completed checkout");
                return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "processing failed"));
            }
        }
        CHECKOUT_SESSION_EXPIRED => match event.checkout_session() {
            Ok(session) => {
                if let Err(e) = state.processor.handle_checkout_expired(session).await {
                    error!(event_id = %event.id, error = %e, "failed to process expired checkout");
                }
            }
            Err(e) => error!(event_id = %event.id, error = %e, "malformed expired checkout event"),
        },
        other => info!(event_type = other, "ignoring webhook event"),
    }

    Ok(Json(json!({ "received": true })))
}

pub async fn health_check() -> &'static str {
    "OK"
}
