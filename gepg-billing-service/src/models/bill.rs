//! Bill and customer models, and the bill lifecycle state machine.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::delivery::DocumentType;

/// Bill lifecycle states.
///
/// `Cancelled` is reachable from every state except `Paid`. A payment may
/// land while the bill is still `ControlNumberRequested` (the gateway does
/// not order callbacks); that transition is allowed and flagged as an
/// anomaly on the bill row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Draft,
    ControlNumberRequested,
    Payable,
    Paid,
    Cancelled,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Draft => "draft",
            BillStatus::ControlNumberRequested => "control_number_requested",
            BillStatus::Payable => "payable",
            BillStatus::Paid => "paid",
            BillStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "draft" => BillStatus::Draft,
            "payable" => BillStatus::Payable,
            "paid" => BillStatus::Paid,
            "cancelled" => BillStatus::Cancelled,
            _ => BillStatus::ControlNumberRequested,
        }
    }

    /// Cancellation is a staff action, blocked once money has moved.
    pub fn can_cancel(&self) -> bool {
        !matches!(self, BillStatus::Paid | BillStatus::Cancelled)
    }

    /// Whether an accepted control-number callback may mark the bill payable.
    pub fn accepts_control_number(&self) -> bool {
        matches!(self, BillStatus::Draft | BillStatus::ControlNumberRequested)
    }

    /// Whether an accepted payment callback may mark the bill paid. Payment
    /// racing ahead of the control-number callback is allowed; a cancelled
    /// bill keeps its status (the payment row is still recorded for
    /// reconciliation).
    pub fn accepts_payment(&self) -> bool {
        !matches!(self, BillStatus::Paid | BillStatus::Cancelled)
    }
}

/// Trigger events emitted by accepted lifecycle transitions and consumed by
/// the notification delivery engine. Duplicate callbacks emit no trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillTrigger {
    ControlNumberAssigned,
    PaymentConfirmed,
}

impl BillTrigger {
    /// Fixed event key for the automatic delivery path. Replays of the same
    /// trigger for the same bill collide on the delivery-record constraint
    /// and are silently absorbed.
    pub fn event_key(&self) -> &'static str {
        match self {
            BillTrigger::ControlNumberAssigned => "auto:control-number-assigned",
            BillTrigger::PaymentConfirmed => "auto:payment-confirmed",
        }
    }

    pub fn document_type(&self) -> DocumentType {
        match self {
            BillTrigger::ControlNumberAssigned => DocumentType::Invoice,
            BillTrigger::PaymentConfirmed => DocumentType::Receipt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub customer_id: Uuid,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub cell_num: Option<String>,
    pub email: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Customer {
    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{} {} {}", self.first_name, middle, self.last_name),
            None => format!("{} {}", self.first_name, self.last_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub cell_num: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bill {
    pub id: Uuid,
    pub bill_id: String,
    pub sys_code: String,
    pub dept_code: String,
    pub description: Option<String>,
    pub revenue_source: String,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub cntrl_num: Option<i64>,
    pub paid_before_payable: bool,
    pub gen_date: DateTime<Utc>,
    pub expr_date: DateTime<Utc>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Bill {
    pub fn status(&self) -> BillStatus {
        BillStatus::from_string(&self.status)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == BillStatus::Cancelled
    }
}

/// Input for issuing a bill. The business bill reference and expiry are
/// derived at issue time, not supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewBill {
    pub sys_code: String,
    pub dept_code: String,
    pub description: Option<String>,
    pub revenue_source: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Bills expire 30 days after issue.
pub const BILL_VALIDITY_DAYS: i64 = 30;

impl NewBill {
    /// Business bill reference: department code plus issue timestamp, with
    /// a short random suffix to guard against same-second collisions.
    pub fn derive_bill_id(&self, issued: DateTime<Utc>) -> String {
        let suffix = &Uuid::new_v4().simple().to_string()[..4];
        format!("{}{}{}", self.dept_code, issued.format("%Y%m%d%H%M%S"), suffix)
    }

    pub fn derive_expiry(issued: DateTime<Utc>) -> DateTime<Utc> {
        issued + Duration::days(BILL_VALIDITY_DAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_blocked_once_paid() {
        assert!(BillStatus::Draft.can_cancel());
        assert!(BillStatus::ControlNumberRequested.can_cancel());
        assert!(BillStatus::Payable.can_cancel());
        assert!(!BillStatus::Paid.can_cancel());
        assert!(!BillStatus::Cancelled.can_cancel());
    }

    #[test]
    fn payment_may_race_ahead_of_control_number() {
        assert!(BillStatus::ControlNumberRequested.accepts_payment());
        assert!(BillStatus::Payable.accepts_payment());
        assert!(!BillStatus::Paid.accepts_payment());
        assert!(!BillStatus::Cancelled.accepts_payment());
    }

    #[test]
    fn automatic_event_keys_are_fixed_per_trigger() {
        assert_eq!(
            BillTrigger::ControlNumberAssigned.event_key(),
            "auto:control-number-assigned"
        );
        assert_eq!(
            BillTrigger::PaymentConfirmed.event_key(),
            "auto:payment-confirmed"
        );
        assert_eq!(
            BillTrigger::ControlNumberAssigned.document_type(),
            DocumentType::Invoice
        );
        assert_eq!(
            BillTrigger::PaymentConfirmed.document_type(),
            DocumentType::Receipt
        );
    }

    #[test]
    fn bill_id_embeds_department_and_issue_time() {
        let input = NewBill {
            sys_code: "NIMR".to_string(),
            dept_code: "HQ01".to_string(),
            description: None,
            revenue_source: "Research Clearance".to_string(),
            amount: Decimal::new(10000, 2),
            currency: "TZS".to_string(),
        };
        let issued = Utc::now();
        let bill_id = input.derive_bill_id(issued);
        assert!(bill_id.starts_with("HQ01"));
        assert_eq!(bill_id.len(), 4 + 14 + 4);
        assert_eq!(
            NewBill::derive_expiry(issued) - issued,
            Duration::days(BILL_VALIDITY_DAYS)
        );
    }
}
