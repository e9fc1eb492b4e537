//! Gateway callback endpoints.
//!
//! Both endpoints acknowledge quickly: state is applied in one database
//! transaction and delivery work is enqueued, never performed inline. A
//! replayed callback answers `duplicate: true` with status 200 so the
//! gateway stops retrying.

use crate::models::{CallbackKind, NewPayment};
use crate::services::database::CallbackApplied;
use crate::services::ledger;
use crate::services::metrics::CALLBACKS_TOTAL;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct ControlNumberCallbackRequest {
    #[validate(length(min = 1, message = "Request id cannot be empty"))]
    pub req_id: String,
    #[validate(length(min = 1, message = "Bill id cannot be empty"))]
    pub bill_id: String,
    #[validate(range(min = 1, message = "Control number must be positive"))]
    pub cntrl_num: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub bill_amt: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub duplicate: bool,
}

#[tracing::instrument(skip(state, request), fields(req_id = %request.req_id, bill_id = %request.bill_id))]
pub async fn control_number_callback(
    State(state): State<AppState>,
    Json(request): Json<ControlNumberCallbackRequest>,
) -> Result<(StatusCode, Json<CallbackResponse>), AppError> {
    request.validate()?;

    let payload_hash = hash_payload(&request)?;
    let result = state
        .db
        .apply_control_number_callback(
            &request.req_id,
            &request.bill_id,
            request.cntrl_num,
            request.bill_amt,
            state.config.gateway.amount_tolerance,
            &payload_hash,
        )
        .await;

    record_outcome(CallbackKind::ControlNumberResponse, &result);
    let applied = result?;

    if let (Some(bill), Some(trigger)) = (&applied.bill, applied.trigger) {
        state.engine.dispatch(bill, None, trigger).await;
    }

    if applied.duplicate {
        tracing::info!(req_id = %request.req_id, "Duplicate control-number callback absorbed");
    }

    Ok((
        StatusCode::OK,
        Json(CallbackResponse {
            duplicate: applied.duplicate,
        }),
    ))
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct PaymentCallbackRequest {
    #[validate(length(min = 1, message = "Bill id cannot be empty"))]
    pub bill_id: String,
    #[validate(length(min = 1, message = "Transaction id cannot be empty"))]
    pub trx_id: String,
    #[validate(length(min = 1, message = "Payment reference cannot be empty"))]
    pub payref_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub paid_amt: Decimal,
    #[validate(length(equal = 3, message = "Currency must be a 3-letter code"))]
    pub paid_ccy: String,
    #[validate(length(min = 1, message = "Payment channel cannot be empty"))]
    pub pay_channel: String,
    pub trx_date: DateTime<Utc>,
    pub pyr_name: Option<String>,
    pub pyr_cell_num: Option<String>,
    #[validate(email(message = "Invalid payer email address"))]
    pub pyr_email: Option<String>,
}

#[tracing::instrument(skip(state, request), fields(bill_id = %request.bill_id, trx_id = %request.trx_id))]
pub async fn payment_callback(
    State(state): State<AppState>,
    Json(request): Json<PaymentCallbackRequest>,
) -> Result<(StatusCode, Json<CallbackResponse>), AppError> {
    request.validate()?;

    let payload_hash = hash_payload(&request)?;
    let payment = NewPayment {
        bill_id: request.bill_id.clone(),
        trx_id: request.trx_id.clone(),
        payref_id: request.payref_id.clone(),
        paid_amt: request.paid_amt,
        paid_ccy: request.paid_ccy.to_uppercase(),
        pay_channel: request.pay_channel.clone(),
        pyr_name: request.pyr_name.clone(),
        pyr_cell_num: request.pyr_cell_num.clone(),
        pyr_email: request.pyr_email.clone(),
        trx_date: request.trx_date,
    };

    let result = state.db.apply_payment_callback(&payment, &payload_hash).await;
    record_outcome(CallbackKind::PaymentNotification, &result);
    let applied = result?;

    if let (Some(bill), Some(trigger)) = (&applied.bill, applied.trigger) {
        state
            .engine
            .dispatch(bill, request.pyr_email.as_deref(), trigger)
            .await;
    }

    if applied.duplicate {
        tracing::info!(trx_id = %request.trx_id, "Duplicate payment callback absorbed");
    }

    Ok((
        StatusCode::OK,
        Json(CallbackResponse {
            duplicate: applied.duplicate,
        }),
    ))
}

fn hash_payload<T: Serialize>(payload: &T) -> Result<String, AppError> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash payload: {}", e)))?;
    Ok(ledger::payload_hash(&bytes))
}

fn record_outcome(kind: CallbackKind, result: &Result<CallbackApplied, AppError>) {
    let outcome = match result {
        Ok(applied) if applied.duplicate => "duplicate",
        Ok(_) => "accepted",
        Err(_) => "rejected",
    };
    if let Some(counter) = CALLBACKS_TOTAL.get() {
        counter.with_label_values(&[kind.as_str(), outcome]).inc();
    }
}
