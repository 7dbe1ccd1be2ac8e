use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::RepositoryError;
use uuid::Uuid;

use crate::models::{NewPayment, Payment, PaymentStatus, Resolution};
use crate::schema::payments;

pub type DbPool = Pool<AsyncPgConnection>;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create(&self, payment: NewPayment) -> Result<Payment, RepositoryError>;

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Payment>, RepositoryError>;

    async fn find_by_checkout_session(&self, session_id: &str) -> Result<Option<Payment>, RepositoryError>;

    async fn set_checkout_session(&self, id: Uuid, session_id: &str, url: &str) -> Result<Payment, RepositoryError>;

    async fn set_intent(&self, id: Uuid, intent_id: &str) -> Result<(), RepositoryError>;

    /// Moves a pending payment to its final status. Returns `None` when the
    /// payment is no longer pending.
    async fn resolve(&self, id: Uuid, resolution: &Resolution) -> Result<Option<Payment>, RepositoryError>;
}

pub struct PgPaymentStore {
    pool: DbPool,
}

impl PgPaymentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, RepositoryError> {
        self.pool.get().await.map_err(RepositoryError::unavailable)
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn create(&self, payment: NewPayment) -> Result<Payment, RepositoryError> {
        let mut conn = self.conn().await?;
        let payment = diesel::insert_into(payments::table)
            .values(&payment)
            .get_result(&mut conn)
            .await?;
        Ok(payment)
    }

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Payment>, RepositoryError> {
        let mut conn = self.conn().await?;
        let payment = payments::table
            .filter(payments::order_id.eq(order_id))
            .first::<Payment>(&mut conn)
            .await
            .optional()?;
        Ok(payment)
    }

    async fn find_by_checkout_session(&self, session_id: &str) -> Result<Option<Payment>, RepositoryError> {
        let mut conn = self.conn().await?;
        let payment = payments::table
            .filter(payments::checkout_session_id.eq(session_id))
            .first::<Payment>(&mut conn)
            .await
            .optional()?;
        Ok(payment)
    }

    async fn set_checkout_session(&self, id: Uuid, session_id: &str, url: &str) -> Result<Payment, RepositoryError> {
        let mut conn = self.conn().await?;
        let payment = diesel::update(payments::table.find(id))
            .set((
                payments::checkout_session_id.eq(session_id),
                payments::checkout_url.eq(url),
                payments::updated_at.eq(Utc::now()),
            ))
            .get_result(&mut conn)
            .await?;
        Ok(payment)
    }

    async fn set_intent(&self, id: Uuid, intent_id: &str) -> Result<(), RepositoryError> {
        let mut conn = self.conn().await?;
        diesel::update(payments::table.find(id))
            .set((payments::gateway_intent_id.eq(intent_id), payments::updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn resolve(&self, id: Uuid, resolution: &Resolution) -> Result<Option<Payment>, RepositoryError> {
        let mut conn = self.conn().await?;
        let target = payments::table
            .filter(payments::id.eq(id))
            .filter(payments::status.eq(PaymentStatus::Pending.as_str()));

        let updated = match resolution {
            Resolution::Succeeded { intent_id, charge_id } => {
                diesel::update(target)
                    .set((
                        payments::status.eq(PaymentStatus::Success.as_str()),
                        payments::gateway_intent_id.eq(intent_id),
                        payments::gateway_charge_id.eq(charge_id),
                        payments::updated_at.eq(Utc::now()),
                    ))
                    .get_result::<Payment>(&mut conn)
                    .await
            }
            Resolution::Failed { status, code, reason } => {
                diesel::update(target)
                    .set((
                        payments::status.eq(status.as_str()),
                        payments::failure_code.eq(code),
                        payments::failure_reason.eq(reason),
                        payments::updated_at.eq(Utc::now()),
                    ))
                    .get_result::<Payment>(&mut conn)
                    .await
            }
        };

        Ok(updated.optional()?)
    }
}

#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: Mutex<HashMap<Uuid, Payment>>,
    unavailable: AtomicBool,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.payments.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn payments(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Payment>>, RepositoryError> {
        if AtomicBool::load(&self.unavailable, Ordering::SeqCst) {
            return Err(RepositoryError::unavailable("payment store is offline"));
        }
        Ok(self.payments.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create(&self, payment: NewPayment) -> Result<Payment, RepositoryError> {
        let mut payments = self.payments()?;
        if payments.values().any(|p| p.order_id == payment.order_id) {
            return Err(RepositoryError::Query(format!(
                "payment for order {} already exists",
                payment.order_id
            )));
        }
        let now = Utc::now();
        let created = Payment {
            id: payment.id,
            order_id: payment.order_id,
            user_id: payment.user_id,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            payment_method_id: payment.payment_method_id,
            checkout_session_id: None,
            checkout_url: None,
            gateway_intent_id: None,
            gateway_charge_id: None,
            failure_code: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        payments.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.payments()?.values().find(|p| p.order_id == order_id).cloned())
    }

    async fn find_by_checkout_session(&self, session_id: &str) -> Result<Option<Payment>, RepositoryError> {
        Ok(self
            .payments()?
            .values()
            .find(|p| p.checkout_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn set_checkout_session(&self, id: Uuid, session_id: &str, url: &str) -> Result<Payment, RepositoryError> {
        let mut payments = self.payments()?;
        let payment = payments.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        payment.checkout_session_id = Some(session_id.to_string());
        payment.checkout_url = Some(url.to_string());
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn set_intent(&self, id: Uuid, intent_id: &str) -> Result<(), RepositoryError> {
        let mut payments = self.payments()?;
        let payment = payments.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        payment.gateway_intent_id = Some(intent_id.to_string());
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn resolve(&self, id: Uuid, resolution: &Resolution) -> Result<Option<Payment>, RepositoryError> {
        let mut payments = self.payments()?;
        let Some(payment) = payments.get_mut(&id) else {
            return Ok(None);
        };
        if payment.status != PaymentStatus::Pending.as_str() {
            return Ok(None);
        }
        match resolution {
            Resolution::Succeeded { intent_id, charge_id } => {
                payment.gateway_intent_id = intent_id.clone();
                payment.gateway_charge_id = charge_id.clone();
            }
            Resolution::Failed { code, reason, .. } => {
                payment.failure_code = Some(code.clone());
                payment.failure_reason = Some(reason.clone());
            }
        }
        payment.status = resolution.status().as_str().to_string();
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }
}
