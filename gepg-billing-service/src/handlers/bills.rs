//! Bill submission and the control-number status polling surface.

use crate::models::{CallbackKind, NewBill, NewCustomer};
use crate::services::ledger;
use crate::services::metrics::SUBMISSIONS_TOTAL;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CustomerInput {
    #[validate(length(min = 1, message = "First name cannot be empty"))]
    pub first_name: String,
    pub middle_name: Option<String>,
    #[validate(length(min = 1, message = "Last name cannot be empty"))]
    pub last_name: String,
    pub cell_num: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitBillRequest {
    #[validate(length(min = 1, message = "System code cannot be empty"))]
    pub sys_code: String,
    #[validate(length(min = 1, message = "Department code cannot be empty"))]
    pub bill_dept: String,
    pub description: Option<String>,
    #[validate(length(min = 1, message = "Revenue source cannot be empty"))]
    pub revenue_source: String,
    #[validate(length(equal = 3, message = "Currency must be a 3-letter code"))]
    pub currency: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[validate(nested)]
    pub customer: CustomerInput,
}

impl SubmitBillRequest {
    /// Normalized content fingerprint for the submission dedup bucket.
    /// Whitespace and letter case do not make a submission distinct.
    fn fingerprint(&self) -> String {
        let norm = |s: &str| s.trim().to_lowercase();
        let opt = |s: &Option<String>| s.as_deref().map(|v| norm(v)).unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            norm(&self.sys_code),
            norm(&self.bill_dept),
            opt(&self.description),
            norm(&self.revenue_source),
            norm(&self.currency),
            self.amount.normalize(),
            norm(&self.customer.first_name),
            opt(&self.customer.middle_name),
            norm(&self.customer.last_name),
            opt(&self.customer.cell_num),
            opt(&self.customer.email),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitBillResponse {
    pub req_id: Option<String>,
    pub bill_id: Option<String>,
    pub status: String,
}

#[tracing::instrument(skip(state, request), fields(sys_code = %request.sys_code, bill_dept = %request.bill_dept))]
pub async fn submit_bill(
    State(state): State<AppState>,
    Json(request): Json<SubmitBillRequest>,
) -> Result<(StatusCode, Json<SubmitBillResponse>), AppError> {
    request.validate()?;

    if request.amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Amount must be positive"
        )));
    }

    let body_hash = ledger::payload_hash(request.fingerprint().as_bytes());
    let window = state.config.gateway.submission_window_secs.max(1);
    let bucket = Utc::now().timestamp().div_euclid(window);
    let dedup_key = format!("{}:{}", bucket, body_hash);

    let customer = NewCustomer {
        first_name: request.customer.first_name.clone(),
        middle_name: request.customer.middle_name.clone(),
        last_name: request.customer.last_name.clone(),
        cell_num: request.customer.cell_num.clone(),
        email: request.customer.email.clone(),
    };
    let new_bill = NewBill {
        sys_code: request.sys_code.clone(),
        dept_code: request.bill_dept.clone(),
        description: request.description.clone(),
        revenue_source: request.revenue_source.clone(),
        amount: request.amount,
        currency: request.currency.to_uppercase(),
    };

    let outcome = state
        .db
        .create_bill_submission(customer, new_bill, &dedup_key, &body_hash)
        .await?;

    let (code, status) = if outcome.duplicate {
        ("duplicate", StatusCode::ACCEPTED)
    } else {
        ("created", StatusCode::CREATED)
    };
    if let Some(counter) = SUBMISSIONS_TOTAL.get() {
        counter.with_label_values(&[code]).inc();
    }

    tracing::info!(
        bill_id = outcome.bill_id.as_deref().unwrap_or(""),
        duplicate = outcome.duplicate,
        "Bill submission processed"
    );

    Ok((
        status,
        Json(SubmitBillResponse {
            req_id: outcome.req_id,
            bill_id: outcome.bill_id,
            status: if outcome.duplicate {
                "in_progress".to_string()
            } else {
                "created".to_string()
            },
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct ControlNumberStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Polling surface for the control-number state. Read-only and cheap; a
/// callback that simply has not arrived yet reads as `pending`, never as an
/// error.
#[tracing::instrument(skip(state))]
pub async fn control_number_status(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
) -> Result<Json<ControlNumberStatusResponse>, AppError> {
    let bill = state
        .db
        .get_bill(&bill_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown bill {}", bill_id)))?;

    if let Some(control_number) = bill.cntrl_num {
        return Ok(Json(ControlNumberStatusResponse {
            status: "assigned".to_string(),
            control_number: Some(control_number),
            message: None,
        }));
    }

    if let Some(rejection) = state
        .db
        .latest_rejection(&bill_id, CallbackKind::ControlNumberResponse)
        .await?
    {
        return Ok(Json(ControlNumberStatusResponse {
            status: "error".to_string(),
            control_number: None,
            message: rejection.detail,
        }));
    }

    Ok(Json(ControlNumberStatusResponse {
        status: "pending".to_string(),
        control_number: None,
        message: Some("Control number has not been assigned yet".to_string()),
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelBillResponse {
    pub bill_id: String,
    pub status: String,
}

/// Staff cancellation. Blocked once the bill is paid; idempotent for an
/// already-cancelled bill.
#[tracing::instrument(skip(state))]
pub async fn cancel_bill(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
) -> Result<Json<CancelBillResponse>, AppError> {
    let bill = state.db.cancel_bill(&bill_id).await?;
    tracing::info!(bill_id = %bill.bill_id, "Bill cancelled");
    Ok(Json(CancelBillResponse {
        bill_id: bill.bill_id,
        status: bill.status,
    }))
}
