//! Gateway callback audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of inbound gateway callback. Doubles as the ledger scope so the
/// uniqueness key spaces of the two callback types never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    ControlNumberResponse,
    PaymentNotification,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::ControlNumberResponse => "control_number_response",
            CallbackKind::PaymentNotification => "payment_notification",
        }
    }

    pub fn ledger_scope(&self) -> &'static str {
        match self {
            CallbackKind::ControlNumberResponse => "gateway:cn",
            CallbackKind::PaymentNotification => "gateway:payment",
        }
    }
}

/// Outcome of processing one callback sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Accepted,
    Duplicate,
    Rejected,
}

impl CallbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackOutcome::Accepted => "accepted",
            CallbackOutcome::Duplicate => "duplicate",
            CallbackOutcome::Rejected => "rejected",
        }
    }
}

/// One row per callback sighting, duplicates and rejections included.
/// Created once, never mutated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GatewayCallbackRecord {
    pub callback_id: Uuid,
    pub kind: String,
    pub external_id: String,
    pub bill_id: Option<String>,
    pub payload_hash: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub received_utc: DateTime<Utc>,
}
