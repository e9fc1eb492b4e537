//! Payment model. A row exists only for an accepted payment callback and is
//! immutable thereafter; `trx_id` and `bill_id` uniqueness bound a bill to
//! at most one payment.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub bill_id: String,
    pub trx_id: String,
    pub payref_id: String,
    pub paid_amt: Decimal,
    pub paid_ccy: String,
    pub pay_channel: String,
    pub pyr_name: Option<String>,
    pub pyr_cell_num: Option<String>,
    pub pyr_email: Option<String>,
    pub trx_date: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub bill_id: String,
    pub trx_id: String,
    pub payref_id: String,
    pub paid_amt: Decimal,
    pub paid_ccy: String,
    pub pay_channel: String,
    pub pyr_name: Option<String>,
    pub pyr_cell_num: Option<String>,
    pub pyr_email: Option<String>,
    pub trx_date: DateTime<Utc>,
}
