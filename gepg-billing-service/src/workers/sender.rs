//! Delivery send attempts.
//!
//! Each attempt reloads the record and skips terminal states, so a job may
//! sit on the queue twice (retry plus recovery sweep) without a double
//! send. Attempt counts live on the record, not in memory, which keeps the
//! retry budget intact across restarts.

use crate::config::DeliveryConfig;
use crate::models::{DeliveryRecord, DeliveryStatus, DocumentType};
use crate::services::database::Database;
use crate::services::mailer::{MailMessage, MailTransport};
use crate::services::metrics::DELIVERY_ATTEMPTS_TOTAL;
use crate::services::notifications::DeliveryJob;
use crate::services::renderer::{DocumentRenderer, RenderRequest};
use crate::workers::composer;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

pub struct DeliverySender {
    db: Database,
    mailer: Arc<dyn MailTransport>,
    renderer: Arc<dyn DocumentRenderer>,
    config: DeliveryConfig,
}

impl DeliverySender {
    pub fn new(
        db: Database,
        mailer: Arc<dyn MailTransport>,
        renderer: Arc<dyn DocumentRenderer>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            db,
            mailer,
            renderer,
            config,
        }
    }

    /// Handle one queued job: attempt the send and, on failure with budget
    /// remaining, schedule the next attempt back onto the queue.
    #[instrument(skip(self, requeue), fields(delivery_id = %job.delivery_id))]
    pub async fn handle_job(&self, job: DeliveryJob, requeue: mpsc::Sender<DeliveryJob>) {
        let record = match self.db.get_delivery(job.delivery_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(delivery_id = %job.delivery_id, "Queued delivery record no longer exists");
                return;
            }
            Err(e) => {
                error!(delivery_id = %job.delivery_id, error = %e, "Failed to load delivery record");
                return;
            }
        };

        match record.status() {
            DeliveryStatus::Sent | DeliveryStatus::NotSent => {
                info!(delivery_id = %record.delivery_id, status = %record.status, "Delivery already terminal, skipping");
                return;
            }
            DeliveryStatus::Pending | DeliveryStatus::Failed => {}
        }
        if record.attempt_count >= self.config.max_attempts {
            warn!(
                delivery_id = %record.delivery_id,
                attempts = record.attempt_count,
                "Delivery retry budget exhausted"
            );
            return;
        }

        let Some(document_type) = record.document_type() else {
            error!(
                delivery_id = %record.delivery_id,
                document_type = %record.document_type,
                "Delivery record has unknown document type"
            );
            return;
        };

        match self.attempt(&record, document_type).await {
            Ok(()) => {
                if let Err(e) = self.db.mark_delivery_sent(record.delivery_id).await {
                    // The email went out; the record will show a stale
                    // pending state until the next sweep retries the write.
                    error!(delivery_id = %record.delivery_id, error = %e, "Failed to persist sent status");
                }
                record_attempt(document_type, "sent");
                info!(
                    delivery_id = %record.delivery_id,
                    bill_id = %record.bill_id,
                    recipient = %record.recipient_email,
                    "Delivery sent"
                );
            }
            Err(e) => {
                record_attempt(document_type, "failed");
                let updated = match self
                    .db
                    .mark_delivery_failed(record.delivery_id, &e.to_string())
                    .await
                {
                    Ok(updated) => updated,
                    Err(db_err) => {
                        error!(delivery_id = %record.delivery_id, error = %db_err, "Failed to persist failure");
                        return;
                    }
                };

                if updated.attempt_count < self.config.max_attempts {
                    let delay = retry_delay(self.config.retry_base_secs, updated.attempt_count);
                    warn!(
                        delivery_id = %record.delivery_id,
                        attempt = updated.attempt_count,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Delivery attempt failed, retry scheduled"
                    );
                    let job = DeliveryJob {
                        delivery_id: record.delivery_id,
                    };
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = requeue.send(job).await;
                    });
                } else {
                    error!(
                        delivery_id = %record.delivery_id,
                        bill_id = %record.bill_id,
                        attempts = updated.attempt_count,
                        error = %e,
                        "Delivery failed permanently"
                    );
                }
            }
        }
    }

    async fn attempt(
        &self,
        record: &DeliveryRecord,
        document_type: DocumentType,
    ) -> Result<(), AppError> {
        let bill = self
            .db
            .get_bill(&record.bill_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Delivery references missing bill {}",
                    record.bill_id
                ))
            })?;
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
        let payment = self.db.get_payment_for_bill(&record.bill_id).await?;

        let pdf = self
            .renderer
            .render(&RenderRequest {
                template_id: document_type.template_id().to_string(),
                context: composer::render_context(&bill, &customer, payment.as_ref()),
            })
            .await?;

        let message = MailMessage {
            to: record.recipient_email.clone(),
            subject: composer::subject(document_type, &bill),
            body: composer::body(document_type, &bill, &customer, payment.as_ref()),
            attachment: Some((
                composer::attachment_filename(document_type, &bill.bill_id),
                pdf,
            )),
        };

        self.mailer.send(&message).await
    }
}

/// Exponential schedule: base delay doubling per completed attempt.
fn retry_delay(base_secs: u64, completed_attempts: i32) -> Duration {
    let exponent = (completed_attempts - 1).clamp(0, 16) as u32;
    Duration::from_secs(base_secs.saturating_mul(1 << exponent))
}

fn record_attempt(document_type: DocumentType, result: &str) {
    if let Some(counter) = DELIVERY_ATTEMPTS_TOTAL.get() {
        counter
            .with_label_values(&[document_type.as_str(), result])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_completed_attempt() {
        assert_eq!(retry_delay(60, 1), Duration::from_secs(60));
        assert_eq!(retry_delay(60, 2), Duration::from_secs(120));
        assert_eq!(retry_delay(60, 3), Duration::from_secs(240));
        assert_eq!(retry_delay(60, 4), Duration::from_secs(480));
    }

    #[test]
    fn retry_delay_is_clamped_against_overflow() {
        assert_eq!(retry_delay(60, 0), Duration::from_secs(60));
        assert_eq!(retry_delay(u64::MAX, 16), Duration::from_secs(u64::MAX));
    }
}
