//! Message composition: subjects, bodies and render contexts for the two
//! document types.

use crate::models::{Bill, Customer, DocumentType, Payment};
use serde_json::json;
use std::collections::BTreeMap;

pub fn subject(document_type: DocumentType, bill: &Bill) -> String {
    match document_type {
        DocumentType::Invoice => format!("Bill {} is ready for payment", bill.bill_id),
        DocumentType::Receipt => format!("Payment receipt for bill {}", bill.bill_id),
    }
}

pub fn body(
    document_type: DocumentType,
    bill: &Bill,
    customer: &Customer,
    payment: Option<&Payment>,
) -> String {
    match document_type {
        DocumentType::Invoice => {
            let control_number = bill
                .cntrl_num
                .map(|n| n.to_string())
                .unwrap_or_else(|| "pending".to_string());
            format!(
                "Dear {},\n\n\
                 Your bill {} of {} {} for {} has been registered.\n\
                 Control number: {}\n\
                 Payable until: {}\n\n\
                 The invoice is attached.\n",
                customer.full_name(),
                bill.bill_id,
                bill.currency,
                bill.amount,
                bill.revenue_source,
                control_number,
                bill.expr_date.format("%Y-%m-%d"),
            )
        }
        DocumentType::Receipt => {
            let (amount, channel, reference) = match payment {
                Some(p) => (
                    format!("{} {}", p.paid_ccy, p.paid_amt),
                    p.pay_channel.clone(),
                    p.payref_id.clone(),
                ),
                None => (
                    format!("{} {}", bill.currency, bill.amount),
                    "unknown".to_string(),
                    "unknown".to_string(),
                ),
            };
            format!(
                "Dear {},\n\n\
                 Payment of {} for bill {} has been received via {}.\n\
                 Payment reference: {}\n\n\
                 The receipt is attached.\n",
                customer.full_name(),
                amount,
                bill.bill_id,
                channel,
                reference,
            )
        }
    }
}

/// Context handed to the document renderer alongside the template id.
pub fn render_context(
    bill: &Bill,
    customer: &Customer,
    payment: Option<&Payment>,
) -> BTreeMap<String, serde_json::Value> {
    let mut context = BTreeMap::new();
    context.insert("bill_id".to_string(), json!(bill.bill_id));
    context.insert("description".to_string(), json!(bill.description));
    context.insert("revenue_source".to_string(), json!(bill.revenue_source));
    context.insert("amount".to_string(), json!(bill.amount.to_string()));
    context.insert("currency".to_string(), json!(bill.currency));
    context.insert("control_number".to_string(), json!(bill.cntrl_num));
    context.insert(
        "generated".to_string(),
        json!(bill.gen_date.format("%Y-%m-%d").to_string()),
    );
    context.insert(
        "expires".to_string(),
        json!(bill.expr_date.format("%Y-%m-%d").to_string()),
    );
    context.insert("customer_name".to_string(), json!(customer.full_name()));

    if let Some(p) = payment {
        context.insert("paid_amount".to_string(), json!(p.paid_amt.to_string()));
        context.insert("paid_currency".to_string(), json!(p.paid_ccy));
        context.insert("pay_channel".to_string(), json!(p.pay_channel));
        context.insert("payref_id".to_string(), json!(p.payref_id));
        context.insert("payer_name".to_string(), json!(p.pyr_name));
        context.insert(
            "paid_date".to_string(),
            json!(p.trx_date.format("%Y-%m-%d").to_string()),
        );
    }

    context
}

pub fn attachment_filename(document_type: DocumentType, bill_id: &str) -> String {
    match document_type {
        DocumentType::Invoice => format!("invoice-{}.pdf", bill_id),
        DocumentType::Receipt => format!("receipt-{}.pdf", bill_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn fixture_bill() -> Bill {
        let now = Utc::now();
        Bill {
            id: Uuid::new_v4(),
            bill_id: "HQ01202601011200009abc".to_string(),
            sys_code: "NIMR".to_string(),
            dept_code: "HQ01".to_string(),
            description: Some("Research clearance".to_string()),
            revenue_source: "Research Clearance".to_string(),
            customer_id: Uuid::new_v4(),
            amount: Decimal::new(10000, 2),
            currency: "TZS".to_string(),
            status: "payable".to_string(),
            cntrl_num: Some(991234567890),
            paid_before_payable: false,
            gen_date: now,
            expr_date: now + chrono::Duration::days(30),
            cancelled_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn fixture_customer() -> Customer {
        let now = Utc::now();
        Customer {
            customer_id: Uuid::new_v4(),
            first_name: "Asha".to_string(),
            middle_name: None,
            last_name: "Mushi".to_string(),
            cell_num: None,
            email: Some("asha@example.com".to_string()),
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn invoice_body_carries_control_number_and_expiry() {
        let bill = fixture_bill();
        let customer = fixture_customer();
        let body = body(DocumentType::Invoice, &bill, &customer, None);
        assert!(body.contains("991234567890"));
        assert!(body.contains(&bill.bill_id));
        assert!(body.contains("Asha Mushi"));
    }

    #[test]
    fn receipt_body_uses_payment_details() {
        let bill = fixture_bill();
        let customer = fixture_customer();
        let now = Utc::now();
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            bill_id: bill.bill_id.clone(),
            trx_id: "TRX1".to_string(),
            payref_id: "REF1".to_string(),
            paid_amt: Decimal::new(10000, 2),
            paid_ccy: "TZS".to_string(),
            pay_channel: "MPESA".to_string(),
            pyr_name: Some("Asha Mushi".to_string()),
            pyr_cell_num: None,
            pyr_email: None,
            trx_date: now,
            created_utc: now,
        };
        let body = body(DocumentType::Receipt, &bill, &customer, Some(&payment));
        assert!(body.contains("MPESA"));
        assert!(body.contains("REF1"));
        assert!(body.contains("TZS 100.00"));
    }

    #[test]
    fn render_context_includes_payment_fields_only_when_paid() {
        let bill = fixture_bill();
        let customer = fixture_customer();
        let context = render_context(&bill, &customer, None);
        assert!(context.contains_key("control_number"));
        assert!(!context.contains_key("payref_id"));
    }
}
