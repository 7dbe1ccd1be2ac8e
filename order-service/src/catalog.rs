use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Food {
    pub id: Uuid,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("food {0} not found")]
    NotFound(Uuid),

    #[error("food catalog unavailable: {0}")]
    Unavailable(String),

    #[error("food catalog returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Price lookup used when an order is placed.
#[async_trait]
pub trait FoodCatalog: Send + Sync {
    async fn get_food(&self, id: Uuid) -> Result<Food, CatalogError>;
}

/// Client for the food service's `GET /food/{id}`.
pub struct HttpFoodCatalog {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFoodCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl FoodCatalog for HttpFoodCatalog {
    async fn get_food(&self, id: Uuid) -> Result<Food, CatalogError> {
        let url = format!("{}/food/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(CatalogError::NotFound(id)),
            status => return Err(CatalogError::Unavailable(format!("GET {url} returned {status}"))),
        }

        let food: Food = response
            .json()
            .await
            .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;
        if !food.price.is_finite() || food.price < 0.0 {
            return Err(CatalogError::InvalidResponse(format!("food {id} has price {}", food.price)));
        }
        Ok(food)
    }
}

#[derive(Default)]
pub struct InMemoryFoodCatalog {
    foods: Mutex<HashMap<Uuid, Food>>,
    unavailable: AtomicBool,
}

impl InMemoryFoodCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Uuid, name: &str, price: f64) {
        let food = Food {
            id,
            name: name.to_string(),
            price,
            description: String::new(),
        };
        self.foods
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, food);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl FoodCatalog for InMemoryFoodCatalog {
    async fn get_food(&self, id: Uuid) -> Result<Food, CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("food catalog is offline".to_string()));
        }
        self.foods
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound(id))
    }
}
