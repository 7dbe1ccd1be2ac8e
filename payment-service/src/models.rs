use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    /// The hosted checkout session lapsed before the customer paid.
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown payment status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "expired" => Ok(PaymentStatus::Expired),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable)]
#[diesel(table_name = crate::schema::payments)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: String,
    pub payment_method_id: Option<String>,
    pub checkout_session_id: Option<String>,
    pub checkout_url: Option<String>,
    pub gateway_intent_id: Option<String>,
    pub gateway_charge_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn status(&self) -> Result<PaymentStatus, UnknownStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewPayment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: String,
    pub payment_method_id: Option<String>,
}

/// How a pending payment was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Succeeded {
        intent_id: Option<String>,
        charge_id: Option<String>,
    },
    Failed {
        status: PaymentStatus,
        code: String,
        reason: String,
    },
}

impl Resolution {
    pub fn failed(code: &str, reason: impl Into<String>) -> Self {
        Resolution::Failed {
            status: PaymentStatus::Failed,
            code: code.to_string(),
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> PaymentStatus {
        match self {
            Resolution::Succeeded { .. } => PaymentStatus::Success,
            Resolution::Failed { status, .. } => *status,
        }
    }
}

pub fn wire_amount(amount: &BigDecimal) -> f64 {
    amount.round(2).to_f64().unwrap_or_default()
}

/// Amount in the currency's smallest unit, as card networks expect it.
pub fn minor_units(amount: &BigDecimal) -> Option<i64> {
    (amount * &BigDecimal::from(100)).round(0).to_i64()
}
