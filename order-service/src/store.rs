use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::RepositoryError;
use uuid::Uuid;

use crate::models::{NewOrder, Order, OrderDetails, OrderItem, OrderStatus};
use crate::schema::{order_items, orders};

pub type DbPool = Pool<AsyncPgConnection>;

/// Persistence for orders and their line items. Status changes touch one
/// row and nothing else.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts the order and all its items atomically.
    async fn create(&self, order: NewOrder, items: Vec<OrderItem>) -> Result<OrderDetails, RepositoryError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderDetails>, RepositoryError>;

    /// Returns `false` when no order has this id.
    async fn update_status(&self, id: Uuid, status: OrderStatus) -> Result<bool, RepositoryError>;

    /// Sets `status` only while the order is still in `expected`.
    /// Returns `false` when the row was missing or already moved on.
    async fn update_status_if(
        &self,
        id: Uuid,
        expected: OrderStatus,
        status: OrderStatus,
    ) -> Result<bool, RepositoryError>;
}

pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, RepositoryError> {
        self.pool.get().await.map_err(RepositoryError::unavailable)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create(&self, order: NewOrder, items: Vec<OrderItem>) -> Result<OrderDetails, RepositoryError> {
        let mut conn = self.conn().await?;

        let created = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                Box::pin(async move {
                    let order: Order = diesel::insert_into(orders::table)
                        .values(&order)
                        .get_result(conn)
                        .await?;

                    let items: Vec<OrderItem> = diesel::insert_into(order_items::table)
                        .values(&items)
                        .get_results(conn)
                        .await?;

                    Ok(OrderDetails { order, items })
                })
            })
            .await?;

        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderDetails>, RepositoryError> {
        let mut conn = self.conn().await?;

        let Some(order) = orders::table
            .find(id)
            .first::<Order>(&mut conn)
            .await
            .optional()?
        else {
            return Ok(None);
        };

        let items = OrderItem::belonging_to(&order)
            .order(order_items::id)
            .load::<OrderItem>(&mut conn)
            .await?;

        Ok(Some(OrderDetails { order, items }))
    }

    async fn update_status(&self, id: Uuid, status: OrderStatus) -> Result<bool, RepositoryError> {
        let mut conn = self.conn().await?;

        let updated = diesel::update(orders::table.find(id))
            .set((orders::status.eq(status.as_str()), orders::updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .await?;

        Ok(updated > 0)
    }

    async fn update_status_if(
        &self,
        id: Uuid,
        expected: OrderStatus,
        status: OrderStatus,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.conn().await?;

        let updated = diesel::update(
            orders::table
                .filter(orders::id.eq(id))
                .filter(orders::status.eq(expected.as_str())),
        )
        .set((orders::status.eq(status.as_str()), orders::updated_at.eq(Utc::now())))
        .execute(&mut conn)
        .await?;

        Ok(updated > 0)
    }
}

/// Process-local store used by tests and local runs without Postgres.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: Mutex<HashMap<Uuid, OrderDetails>>,
    unavailable: AtomicBool,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`RepositoryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn orders(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, OrderDetails>>, RepositoryError> {
        if AtomicBool::load(&self.unavailable, Ordering::SeqCst) {
            return Err(RepositoryError::unavailable("order store is offline"));
        }
        Ok(self.orders.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: NewOrder, items: Vec<OrderItem>) -> Result<OrderDetails, RepositoryError> {
        let mut orders = self.orders()?;
        if orders.contains_key(&order.id) {
            return Err(RepositoryError::Query(format!("duplicate order id {}", order.id)));
        }
        let now = Utc::now();
        let details = OrderDetails {
            order: Order {
                id: order.id,
                user_id: order.user_id,
                status: order.status,
                total_amount: order.total_amount,
                currency: order.currency,
                payment_method_id: order.payment_method_id,
                created_at: now,
                updated_at: now,
            },
            items,
        };
        orders.insert(details.order.id, details.clone());
        Ok(details)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderDetails>, RepositoryError> {
        Ok(self.orders()?.get(&id).cloned())
    }

    async fn update_status(&self, id: Uuid, status: OrderStatus) -> Result<bool, RepositoryError> {
        let mut orders = self.orders()?;
        let Some(details) = orders.get_mut(&id) else {
            return Ok(false);
        };
        details.order.status = status.as_str().to_string();
        details.order.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_status_if(
        &self,
        id: Uuid,
        expected: OrderStatus,
        status: OrderStatus,
    ) -> Result<bool, RepositoryError> {
        let mut orders = self.orders()?;
        match orders.get_mut(&id) {
            Some(details) if details.order.status == expected.as_str() => {
                details.order.status = status.as_str().to_string();
                details.order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
