//! Notification engine: turns lifecycle triggers into delivery records and
//! queue work.
//!
//! Creation is the idempotency point. A delivery record is inserted per
//! (bill, document type, recipient, event key) and only a successful
//! insert enqueues work, so replayed triggers produce no second email no
//! matter how often the gateway repeats itself.

use crate::config::DeliveryConfig;
use crate::models::{manual_event_key, Bill, BillTrigger, DeliveryRecord, DocumentType};
use crate::services::database::Database;
use crate::services::metrics::SUPPRESSIONS_TOTAL;
use crate::services::recipients::{self, Resolution};
use service_core::error::AppError;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use validator::ValidateEmail;

/// Unit of queue work: the record id is enough, the worker reloads state
/// from the database so stale queue entries are harmless.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryJob {
    pub delivery_id: uuid::Uuid,
}

#[derive(Clone)]
pub struct NotificationEngine {
    db: Database,
    queue: mpsc::Sender<DeliveryJob>,
    policy: DeliveryConfig,
}

impl NotificationEngine {
    pub fn new(db: Database, queue: mpsc::Sender<DeliveryJob>, policy: DeliveryConfig) -> Self {
        Self { db, queue, policy }
    }

    /// Best-effort dispatch for the callback path. Delivery problems are an
    /// internal concern; the gateway acknowledgement already went out, so
    /// failures here are logged and swallowed.
    pub async fn dispatch(&self, bill: &Bill, payer_email: Option<&str>, trigger: BillTrigger) {
        if let Err(e) = self.try_dispatch(bill, payer_email, trigger).await {
            error!(
                bill_id = %bill.bill_id,
                event_key = trigger.event_key(),
                error = %e,
                "Failed to dispatch notification deliveries"
            );
        }
    }

    #[instrument(skip(self, bill, payer_email), fields(bill_id = %bill.bill_id, event_key = trigger.event_key()))]
    async fn try_dispatch(
        &self,
        bill: &Bill,
        payer_email: Option<&str>,
        trigger: BillTrigger,
    ) -> Result<(), AppError> {
        if bill.is_cancelled() {
            info!(bill_id = %bill.bill_id, "Bill is cancelled, no deliveries enqueued");
            return Ok(());
        }

        let customer = self
            .db
            .get_customer(bill.customer_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Bill {} references missing customer",
                    bill.bill_id
                ))
            })?;

        let document_type = trigger.document_type();
        let event_key = trigger.event_key();

        match recipients::resolve(&self.policy, customer.email.as_deref(), payer_email) {
            Resolution::Suppressed(reason) => {
                self.record_suppression(&bill.bill_id, document_type, event_key, reason)
                    .await
            }
            Resolution::Recipients(addresses) => {
                for address in addresses {
                    self.create_and_enqueue(&bill.bill_id, document_type, &address, event_key)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Staff-triggered resend. Mints a fresh event key, so it always
    /// creates new delivery records regardless of what the automatic path
    /// already did.
    #[instrument(skip(self))]
    pub async fn resend(
        &self,
        bill_id: &str,
        document_type: DocumentType,
        recipient_override: Option<&str>,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let bill = self
            .db
            .get_bill(bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown bill {}", bill_id)))?;

        let payment = self.db.get_payment_for_bill(bill_id).await?;
        if document_type == DocumentType::Receipt && payment.is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Bill {} has no payment, receipt cannot be resent",
                bill_id
            )));
        }

        let addresses = match recipient_override {
            Some(addr) => {
                if !addr.validate_email() {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Invalid recipient address"
                    )));
                }
                vec![addr.to_string()]
            }
            None => {
                let customer = self.db.get_customer(bill.customer_id).await?;
                let customer_email = customer.as_ref().and_then(|c| c.email.as_deref());
                let payer_email = payment.as_ref().and_then(|p| p.pyr_email.as_deref());
                match recipients::resolve(&self.policy, customer_email, payer_email) {
                    Resolution::Recipients(addresses) => addresses,
                    Resolution::Suppressed(reason) => {
                        return Err(AppError::BadRequest(anyhow::anyhow!(
                            "No recipient available: {}",
                            reason
                        )));
                    }
                }
            }
        };

        let event_key = manual_event_key();
        let mut records = Vec::with_capacity(addresses.len());
        for address in addresses {
            if let Some(record) = self
                .create_and_enqueue(bill_id, document_type, &address, &event_key)
                .await?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Re-enqueue a persisted record, used by the startup recovery sweep
    /// and by the retry scheduler.
    pub async fn enqueue(&self, job: DeliveryJob) {
        if let Err(e) = self.queue.send(job).await {
            // Only fails during shutdown; the record stays pending and the
            // next startup sweep picks it up.
            warn!(delivery_id = %job.delivery_id, error = %e, "Delivery queue closed");
        }
    }

    async fn create_and_enqueue(
        &self,
        bill_id: &str,
        document_type: DocumentType,
        recipient: &str,
        event_key: &str,
    ) -> Result<Option<DeliveryRecord>, AppError> {
        let Some(record) = self
            .db
            .insert_delivery_if_new(bill_id, document_type, recipient, event_key)
            .await?
        else {
            info!(
                bill_id = bill_id,
                event_key = event_key,
                recipient = recipient,
                "Delivery already recorded for this event, skipping"
            );
            return Ok(None);
        };

        self.enqueue(DeliveryJob {
            delivery_id: record.delivery_id,
        })
        .await;
        Ok(Some(record))
    }

    async fn record_suppression(
        &self,
        bill_id: &str,
        document_type: DocumentType,
        event_key: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        warn!(
            bill_id = bill_id,
            document_type = document_type.as_str(),
            reason = reason,
            "Delivery suppressed"
        );
        if let Some(counter) = SUPPRESSIONS_TOTAL.get() {
            counter
                .with_label_values(&[document_type.as_str(), reason])
                .inc();
        }
        self.db
            .insert_suppression(bill_id, document_type, event_key, reason)
            .await
    }
}
