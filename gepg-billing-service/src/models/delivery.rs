//! Delivery records: the notification engine's unit of idempotency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Invoice,
    Receipt,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "INVOICE",
            DocumentType::Receipt => "RECEIPT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INVOICE" => Some(DocumentType::Invoice),
            "RECEIPT" => Some(DocumentType::Receipt),
            _ => None,
        }
    }

    /// Template id handed to the document renderer.
    pub fn template_id(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "bill_transfer_print_pdf",
            DocumentType::Receipt => "bill_receipt_print_pdf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Terminal for its event key: suppressed by policy, nothing was sent.
    NotSent,
    /// Enqueued, awaiting a send attempt.
    Pending,
    /// Terminal success.
    Sent,
    /// Awaiting retry, or terminal once attempts are exhausted.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::NotSent => "not_sent",
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "not_sent" => DeliveryStatus::NotSent,
            "sent" => DeliveryStatus::Sent,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }
}

/// Audit/state row for one attempted or completed notification send.
/// Unique on (bill, document type, recipient, event key); mutated only by
/// the delivery worker, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryRecord {
    pub delivery_id: Uuid,
    pub bill_id: String,
    pub document_type: String,
    pub recipient_email: String,
    pub event_key: String,
    pub status: String,
    pub attempt_count: i32,
    pub last_attempt_utc: Option<DateTime<Utc>>,
    pub sent_utc: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::from_string(&self.status)
    }

    pub fn document_type(&self) -> Option<DocumentType> {
        DocumentType::parse(&self.document_type)
    }
}

/// Manual resends mint a fresh key so they can never collide with the
/// automatic path, in either direction.
pub fn manual_event_key() -> String {
    format!("manual:{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_keys_are_unique() {
        let a = manual_event_key();
        let b = manual_event_key();
        assert!(a.starts_with("manual:"));
        assert_ne!(a, b);
    }

    #[test]
    fn document_type_round_trips_known_values_only() {
        assert_eq!(DocumentType::parse("INVOICE"), Some(DocumentType::Invoice));
        assert_eq!(DocumentType::parse("RECEIPT"), Some(DocumentType::Receipt));
        assert_eq!(DocumentType::parse("invoice"), None);
    }
}
