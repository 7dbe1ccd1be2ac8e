use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::RepositoryError;
use uuid::Uuid;

use crate::models::{wire_amount, OrderDetails};
use crate::saga::{CreateOrder, OrderError, OrderSaga};

#[derive(Clone)]
pub struct AppState {
    pub saga: Arc<OrderSaga>,
}

#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub food_id: Uuid,
    pub quantity: i32,
    pub price: f64,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub total_amount: f64,
    pub currency: String,
    pub payment_method_id: Option<String>,
    pub order_items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderDetails> for OrderResponse {
    fn from(details: OrderDetails) -> Self {
        let order = details.order;
        Self {
            id: order.id,
            user_id: order.user_id,
            status: order.status,
            total_amount: wire_amount(&order.total_amount),
            currency: order.currency,
            payment_method_id: order.payment_method_id,
            order_items: details
                .items
                .into_iter()
                .map(|item| OrderItemResponse {
                    id: item.id,
                    food_id: item.food_id,
                    quantity: item.quantity,
                    price: wire_amount(&item.price),
                })
                .collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
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

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Repository(e) => e.into(),
            OrderError::Catalog(e) => {
                tracing::warn!(error = %e, "food catalog lookup failed");
                ApiError::new(StatusCode::BAD_GATEWAY, e.to_string())
            }
            invalid => ApiError::new(StatusCode::BAD_REQUEST, invalid.to_string()),
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        tracing::error!(error = %err, "order store failure");
        match err {
            RepositoryError::Unavailable(_) => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "order store unavailable"),
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<CreateOrder>, JsonRejection>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;

    let details = state.saga.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(details.into())))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid order ID"))?;

    match state.saga.get_order(id).await? {
        Some(details) => Ok(Json(details.into())),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "order not found")),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
