//! Staff-only delivery tooling: listing a bill's delivery records and
//! manual resend.

use crate::models::{DeliveryRecord, DocumentType};
use crate::startup::AppState;
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

pub const STAFF_TOKEN_HEADER: &str = "x-staff-token";

/// Shared-token gate for the `/internal` routes.
pub async fn staff_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = request
        .headers()
        .get(STAFF_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(token) if token == state.config.staff_token => Ok(next.run(request).await),
        _ => {
            tracing::warn!(uri = %request.uri(), "Rejected internal request without valid staff token");
            Err(AppError::Unauthorized(anyhow::anyhow!(
                "Missing or invalid staff token"
            )))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeliveriesResponse {
    pub bill_id: String,
    pub deliveries: Vec<DeliveryRecord>,
}

#[tracing::instrument(skip(state))]
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
) -> Result<Json<DeliveriesResponse>, AppError> {
    state
        .db
        .get_bill(&bill_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown bill {}", bill_id)))?;

    let deliveries = state.db.list_deliveries(&bill_id).await?;
    Ok(Json(DeliveriesResponse { bill_id, deliveries }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResendRequest {
    pub document_type: String,
    #[validate(email(message = "Invalid recipient address"))]
    pub recipient_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResendResponse {
    pub status: String,
    pub deliveries: Vec<DeliveryRecord>,
}

#[tracing::instrument(skip(state, request), fields(document_type = %request.document_type))]
pub async fn resend_delivery(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
    Json(request): Json<ResendRequest>,
) -> Result<(StatusCode, Json<ResendResponse>), AppError> {
    request.validate()?;

    let document_type = DocumentType::parse(&request.document_type).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!(
            "Unknown document type {}",
            request.document_type
        ))
    })?;

    let deliveries = state
        .engine
        .resend(&bill_id, document_type, request.recipient_email.as_deref())
        .await?;

    tracing::info!(
        bill_id = %bill_id,
        document_type = document_type.as_str(),
        count = deliveries.len(),
        "Manual resend enqueued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ResendResponse {
            status: "accepted".to_string(),
            deliveries,
        }),
    ))
}
