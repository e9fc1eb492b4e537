//! Database service: connection pool, transactional callback application,
//! and all persistence for bills, payments and delivery records.
//!
//! Every state mutation driven by a gateway callback is gated by a ledger
//! insert inside the same transaction, so "ledger says accepted but the
//! state write failed" cannot happen.

use crate::models::{
    Bill, BillStatus, BillTrigger, CallbackKind, CallbackOutcome, Customer, DeliveryRecord,
    DeliveryStatus, DocumentType, GatewayCallbackRecord, NewBill, NewCustomer, NewPayment,
    Payment,
};
use crate::services::ledger::{self, SCOPE_SUBMISSION};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Rejection reasons for gateway callbacks. These are acknowledged as
/// failed so the gateway retries only once the upstream corrects itself.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("InvalidBillReference: no active bill {0}")]
    InvalidBillReference(String),

    #[error("AmountMismatch: gateway billed {billed} but bill {bill_id} is for {expected}")]
    AmountMismatch {
        bill_id: String,
        billed: Decimal,
        expected: Decimal,
    },

    #[error("ControlNumberConflict: bill {bill_id} already has control number {existing}")]
    ControlNumberConflict { bill_id: String, existing: i64 },
}

impl From<CallbackError> for AppError {
    fn from(err: CallbackError) -> Self {
        match err {
            CallbackError::InvalidBillReference(_) => {
                AppError::BadRequest(anyhow::Error::new(err))
            }
            CallbackError::AmountMismatch { .. } | CallbackError::ControlNumberConflict { .. } => {
                AppError::Conflict(anyhow::Error::new(err))
            }
        }
    }
}

/// Result of applying a callback: whether it was a replay, and the trigger
/// to hand to the notification engine when a transition happened.
#[derive(Debug)]
pub struct CallbackApplied {
    pub duplicate: bool,
    pub bill: Option<Bill>,
    pub trigger: Option<BillTrigger>,
}

#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub req_id: Option<String>,
    pub bill_id: Option<String>,
    pub duplicate: bool,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "gepg-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Bill submission
    // =========================================================================

    /// Issue a bill, deduplicating identical submissions inside the
    /// configured time window. The dedup entry lives in the ledger (not in
    /// process memory) so it survives restarts and is correct across
    /// workers.
    #[instrument(skip(self, customer, new_bill, body_hash))]
    pub async fn create_bill_submission(
        &self,
        customer: NewCustomer,
        new_bill: NewBill,
        dedup_key: &str,
        body_hash: &str,
    ) -> Result<SubmissionOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_bill_submission"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        let created =
            ledger::record_if_new(&mut tx, SCOPE_SUBMISSION, dedup_key, Some(body_hash), None)
                .await?;

        if !created {
            let context = ledger::fetch_context(&mut tx, SCOPE_SUBMISSION, dedup_key).await?;
            tx.commit().await?;
            timer.observe_duration();

            let req_id = context
                .as_ref()
                .and_then(|c| c.get("req_id"))
                .and_then(|v| v.as_str())
                .map(String::from);
            let bill_id = context
                .as_ref()
                .and_then(|c| c.get("bill_id"))
                .and_then(|v| v.as_str())
                .map(String::from);
            return Ok(SubmissionOutcome {
                req_id,
                bill_id,
                duplicate: true,
            });
        }

        let customer = upsert_customer(&mut tx, customer).await?;

        let issued = Utc::now();
        let bill_id = new_bill.derive_bill_id(issued);
        let expiry = NewBill::derive_expiry(issued);

        // Submission is the draft -> control-number-requested transition;
        // the draft state never rests in storage.
        sqlx::query(
            r#"
            INSERT INTO bills (id, bill_id, sys_code, dept_code, description, revenue_source,
                               customer_id, amount, currency, status, gen_date, expr_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&bill_id)
        .bind(&new_bill.sys_code)
        .bind(&new_bill.dept_code)
        .bind(&new_bill.description)
        .bind(&new_bill.revenue_source)
        .bind(customer.customer_id)
        .bind(new_bill.amount)
        .bind(&new_bill.currency)
        .bind(BillStatus::ControlNumberRequested.as_str())
        .bind(issued)
        .bind(expiry)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create bill: {}", e)))?;

        let req_id = Uuid::new_v4().to_string();
        ledger::store_context(
            &mut tx,
            SCOPE_SUBMISSION,
            dedup_key,
            &serde_json::json!({ "req_id": req_id, "bill_id": bill_id }),
        )
        .await?;

        tx.commit().await?;
        timer.observe_duration();

        Ok(SubmissionOutcome {
            req_id: Some(req_id),
            bill_id: Some(bill_id),
            duplicate: false,
        })
    }

    // =========================================================================
    // Gateway callback application
    // =========================================================================

    /// Apply a control-number response callback. Exactly one of the
    /// following happens: the bill transitions to payable (first sighting),
    /// nothing changes (duplicate), or the callback is rejected with a
    /// reason the gateway can act on. Every sighting is audited.
    #[instrument(skip(self, payload_hash), fields(req_id = %req_id, bill_id = %bill_id))]
    pub async fn apply_control_number_callback(
        &self,
        req_id: &str,
        bill_id: &str,
        cntrl_num: i64,
        bill_amt: Decimal,
        tolerance: Decimal,
        payload_hash: &str,
    ) -> Result<CallbackApplied, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_control_number_callback"])
            .start_timer();

        let result = self
            .try_apply_control_number(req_id, bill_id, cntrl_num, bill_amt, tolerance)
            .await;

        self.audit_callback(
            CallbackKind::ControlNumberResponse,
            req_id,
            Some(bill_id),
            payload_hash,
            &result,
        )
        .await;

        timer.observe_duration();
        result
    }

    async fn try_apply_control_number(
        &self,
        req_id: &str,
        bill_id: &str,
        cntrl_num: i64,
        bill_amt: Decimal,
        tolerance: Decimal,
    ) -> Result<CallbackApplied, AppError> {
        let mut tx = self.pool.begin().await?;

        let mut bill = lock_bill(&mut tx, bill_id)
            .await?
            .ok_or_else(|| CallbackError::InvalidBillReference(bill_id.to_string()))?;

        if bill.is_cancelled() {
            return Err(CallbackError::InvalidBillReference(bill_id.to_string()).into());
        }

        // Mismatch is reported, never silently accepted.
        if (bill.amount - bill_amt).abs() > tolerance {
            return Err(CallbackError::AmountMismatch {
                bill_id: bill_id.to_string(),
                billed: bill_amt,
                expected: bill.amount,
            }
            .into());
        }

        let scope = CallbackKind::ControlNumberResponse.ledger_scope();
        let created = ledger::record_if_new(&mut tx, scope, req_id, None, None).await?;
        if !created {
            tx.commit().await?;
            return Ok(CallbackApplied {
                duplicate: true,
                bill: Some(bill),
                trigger: None,
            });
        }

        match bill.cntrl_num {
            None => {
                // Assign; once assigned the value is immutable. A bill that
                // was already paid (payment raced ahead) keeps its status.
                let new_status = if bill.status().accepts_control_number() {
                    BillStatus::Payable
                } else {
                    bill.status()
                };
                sqlx::query(
                    r#"
                    UPDATE bills
                    SET cntrl_num = $2, status = $3, updated_utc = now()
                    WHERE bill_id = $1
                    "#,
                )
                .bind(bill_id)
                .bind(cntrl_num)
                .bind(new_status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to assign control number: {}",
                        e
                    ))
                })?;
                tx.commit().await?;

                bill.cntrl_num = Some(cntrl_num);
                bill.status = new_status.as_str().to_string();
                Ok(CallbackApplied {
                    duplicate: false,
                    bill: Some(bill),
                    trigger: Some(BillTrigger::ControlNumberAssigned),
                })
            }
            Some(existing) if existing == cntrl_num => {
                // New request id, same assignment: no-op, no trigger.
                tx.commit().await?;
                Ok(CallbackApplied {
                    duplicate: false,
                    bill: Some(bill),
                    trigger: None,
                })
            }
            Some(existing) => {
                // Data corruption signal. Roll back so the ledger does not
                // consume this request id either.
                Err(CallbackError::ControlNumberConflict {
                    bill_id: bill_id.to_string(),
                    existing,
                }
                .into())
            }
        }
    }

    /// Apply a payment notification callback. The transaction id is the
    /// idempotency key; a bill holds at most one accepted payment, so a
    /// second payment with a fresh transaction id is absorbed as a
    /// duplicate rather than an error.
    #[instrument(skip(self, payment, payload_hash), fields(bill_id = %payment.bill_id, trx_id = %payment.trx_id))]
    pub async fn apply_payment_callback(
        &self,
        payment: &NewPayment,
        payload_hash: &str,
    ) -> Result<CallbackApplied, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_payment_callback"])
            .start_timer();

        let result = self.try_apply_payment(payment).await;

        self.audit_callback(
            CallbackKind::PaymentNotification,
            &payment.trx_id,
            Some(&payment.bill_id),
            payload_hash,
            &result,
        )
        .await;

        timer.observe_duration();
        result
    }

    async fn try_apply_payment(&self, payment: &NewPayment) -> Result<CallbackApplied, AppError> {
        let mut tx = self.pool.begin().await?;

        let mut bill = lock_bill(&mut tx, &payment.bill_id)
            .await?
            .ok_or_else(|| CallbackError::InvalidBillReference(payment.bill_id.clone()))?;

        let scope = CallbackKind::PaymentNotification.ledger_scope();
        let created = ledger::record_if_new(&mut tx, scope, &payment.trx_id, None, None).await?;
        if !created {
            tx.commit().await?;
            return Ok(CallbackApplied {
                duplicate: true,
                bill: Some(bill),
                trigger: None,
            });
        }

        // Defensive double-check beyond the ledger: an already-paid bill
        // absorbs further payment callbacks as duplicates.
        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT payment_id FROM payments WHERE bill_id = $1")
                .bind(&payment.bill_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Payment lookup failed: {}", e))
                })?;
        if existing.is_some() {
            tx.commit().await?;
            return Ok(CallbackApplied {
                duplicate: true,
                bill: Some(bill),
                trigger: None,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO payments (payment_id, bill_id, trx_id, payref_id, paid_amt, paid_ccy,
                                  pay_channel, pyr_name, pyr_cell_num, pyr_email, trx_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&payment.bill_id)
        .bind(&payment.trx_id)
        .bind(&payment.payref_id)
        .bind(payment.paid_amt)
        .bind(&payment.paid_ccy)
        .bind(&payment.pay_channel)
        .bind(&payment.pyr_name)
        .bind(&payment.pyr_cell_num)
        .bind(&payment.pyr_email)
        .bind(payment.trx_date)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create payment: {}", e)))?;

        // A cancelled bill never transitions to paid and never triggers a
        // receipt. The payment row above still stands; the money moved and
        // reconciliation needs to see it.
        if !bill.status().accepts_payment() {
            warn!(
                bill_id = %payment.bill_id,
                trx_id = %payment.trx_id,
                status = %bill.status,
                "Payment recorded against a bill that cannot be marked paid"
            );
            tx.commit().await?;
            return Ok(CallbackApplied {
                duplicate: false,
                bill: Some(bill),
                trigger: None,
            });
        }

        // Payment may land before the control-number callback; allowed,
        // flagged for operator review.
        let raced_ahead = bill.status() == BillStatus::ControlNumberRequested;
        if raced_ahead {
            warn!(
                bill_id = %payment.bill_id,
                trx_id = %payment.trx_id,
                "Payment accepted before control-number callback"
            );
        }

        sqlx::query(
            r#"
            UPDATE bills
            SET status = $2, paid_before_payable = paid_before_payable OR $3, updated_utc = now()
            WHERE bill_id = $1
            "#,
        )
        .bind(&payment.bill_id)
        .bind(BillStatus::Paid.as_str())
        .bind(raced_ahead)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark bill paid: {}", e)))?;

        tx.commit().await?;

        bill.status = BillStatus::Paid.as_str().to_string();
        bill.paid_before_payable = bill.paid_before_payable || raced_ahead;
        Ok(CallbackApplied {
            duplicate: false,
            bill: Some(bill),
            trigger: Some(BillTrigger::PaymentConfirmed),
        })
    }

    /// Append the audit row for a callback sighting. Runs outside the
    /// application transaction so rejected sightings are recorded even
    /// though their state changes rolled back. Audit failures are logged,
    /// never propagated: the processing outcome already stands.
    async fn audit_callback(
        &self,
        kind: CallbackKind,
        external_id: &str,
        bill_id: Option<&str>,
        payload_hash: &str,
        result: &Result<CallbackApplied, AppError>,
    ) {
        let (outcome, detail) = match result {
            Ok(applied) if applied.duplicate => (CallbackOutcome::Duplicate, None),
            Ok(_) => (CallbackOutcome::Accepted, None),
            Err(AppError::BadRequest(e)) | Err(AppError::Conflict(e)) => {
                (CallbackOutcome::Rejected, Some(e.to_string()))
            }
            // Unexpected failure: no outcome to audit, the gateway retries.
            Err(_) => return,
        };

        let insert = sqlx::query(
            r#"
            INSERT INTO gateway_callbacks (callback_id, kind, external_id, bill_id, payload_hash, outcome, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(external_id)
        .bind(bill_id)
        .bind(payload_hash)
        .bind(outcome.as_str())
        .bind(detail)
        .execute(&self.pool)
        .await;

        if let Err(e) = insert {
            warn!(
                kind = kind.as_str(),
                external_id = external_id,
                error = %e,
                "Failed to record callback audit row"
            );
        }
    }

    // =========================================================================
    // Bill queries and cancellation
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn get_bill(&self, bill_id: &str) -> Result<Option<Bill>, AppError> {
        let bill = sqlx::query_as::<_, Bill>(
            r#"
            SELECT id, bill_id, sys_code, dept_code, description, revenue_source, customer_id,
                   amount, currency, status, cntrl_num, paid_before_payable, gen_date, expr_date,
                   cancelled_utc, created_utc, updated_utc
            FROM bills WHERE bill_id = $1
            "#,
        )
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load bill: {}", e)))?;
        Ok(bill)
    }

    #[instrument(skip(self))]
    pub async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, first_name, middle_name, last_name, cell_num, email,
                   created_utc, updated_utc
            FROM customers WHERE customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load customer: {}", e)))?;
        Ok(customer)
    }

    #[instrument(skip(self))]
    pub async fn get_payment_for_bill(&self, bill_id: &str) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, bill_id, trx_id, payref_id, paid_amt, paid_ccy, pay_channel,
                   pyr_name, pyr_cell_num, pyr_email, trx_date, created_utc
            FROM payments WHERE bill_id = $1
            "#,
        )
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load payment: {}", e)))?;
        Ok(payment)
    }

    /// Cancel a bill. Blocked once paid. Cancellation only suppresses
    /// future delivery enqueues; in-flight sends complete.
    #[instrument(skip(self))]
    pub async fn cancel_bill(&self, bill_id: &str) -> Result<Bill, AppError> {
        let mut tx = self.pool.begin().await?;

        let bill = lock_bill(&mut tx, bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown bill {}", bill_id)))?;

        if bill.status() == BillStatus::Cancelled {
            tx.commit().await?;
            return Ok(bill);
        }
        if !bill.status().can_cancel() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Bill {} is already paid and cannot be cancelled",
                bill_id
            )));
        }

        let bill = sqlx::query_as::<_, Bill>(
            r#"
            UPDATE bills
            SET status = $2, cancelled_utc = now(), updated_utc = now()
            WHERE bill_id = $1
            RETURNING id, bill_id, sys_code, dept_code, description, revenue_source, customer_id,
                      amount, currency, status, cntrl_num, paid_before_payable, gen_date, expr_date,
                      cancelled_utc, created_utc, updated_utc
            "#,
        )
        .bind(bill_id)
        .bind(BillStatus::Cancelled.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to cancel bill: {}", e)))?;

        tx.commit().await?;
        Ok(bill)
    }

    /// Most recent rejected callback sighting for a bill, for the status
    /// query surface.
    #[instrument(skip(self))]
    pub async fn latest_rejection(
        &self,
        bill_id: &str,
        kind: CallbackKind,
    ) -> Result<Option<GatewayCallbackRecord>, AppError> {
        let record = sqlx::query_as::<_, GatewayCallbackRecord>(
            r#"
            SELECT callback_id, kind, external_id, bill_id, payload_hash, outcome, detail, received_utc
            FROM gateway_callbacks
            WHERE bill_id = $1 AND kind = $2 AND outcome = 'rejected'
            ORDER BY received_utc DESC
            LIMIT 1
            "#,
        )
        .bind(bill_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load callbacks: {}", e)))?;
        Ok(record)
    }

    // =========================================================================
    // Delivery records
    // =========================================================================

    /// Create a delivery record unless one already exists for this event
    /// key. Returns the new record on first sighting, `None` when the
    /// unique constraint absorbed a replay.
    #[instrument(skip(self))]
    pub async fn insert_delivery_if_new(
        &self,
        bill_id: &str,
        document_type: DocumentType,
        recipient_email: &str,
        event_key: &str,
    ) -> Result<Option<DeliveryRecord>, AppError> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            INSERT INTO delivery_records (delivery_id, bill_id, document_type, recipient_email,
                                          event_key, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (bill_id, document_type, recipient_email, event_key) DO NOTHING
            RETURNING delivery_id, bill_id, document_type, recipient_email, event_key, status,
                      attempt_count, last_attempt_utc, sent_utc, failure_reason,
                      created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bill_id)
        .bind(document_type.as_str())
        .bind(recipient_email)
        .bind(event_key)
        .bind(DeliveryStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create delivery record: {}", e))
        })?;
        Ok(record)
    }

    /// Record a policy suppression: a `not_sent` row with the reason,
    /// visible to staff. Replays collide on the same event key.
    #[instrument(skip(self))]
    pub async fn insert_suppression(
        &self,
        bill_id: &str,
        document_type: DocumentType,
        event_key: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (delivery_id, bill_id, document_type, recipient_email,
                                          event_key, status, failure_reason)
            VALUES ($1, $2, $3, '', $4, $5, $6)
            ON CONFLICT (bill_id, document_type, recipient_email, event_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bill_id)
        .bind(document_type.as_str())
        .bind(event_key)
        .bind(DeliveryStatus::NotSent.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record suppression: {}", e))
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<DeliveryRecord>, AppError> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT delivery_id, bill_id, document_type, recipient_email, event_key, status,
                   attempt_count, last_attempt_utc, sent_utc, failure_reason,
                   created_utc, updated_utc
            FROM delivery_records WHERE delivery_id = $1
            "#,
        )
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load delivery: {}", e)))?;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn list_deliveries(&self, bill_id: &str) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT delivery_id, bill_id, document_type, recipient_email, event_key, status,
                   attempt_count, last_attempt_utc, sent_utc, failure_reason,
                   created_utc, updated_utc
            FROM delivery_records WHERE bill_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list deliveries: {}", e)))?;
        Ok(records)
    }

    #[instrument(skip(self))]
    pub async fn mark_delivery_sent(&self, delivery_id: Uuid) -> Result<DeliveryRecord, AppError> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            UPDATE delivery_records
            SET status = $2, attempt_count = attempt_count + 1, last_attempt_utc = now(),
                sent_utc = now(), failure_reason = NULL, updated_utc = now()
            WHERE delivery_id = $1
            RETURNING delivery_id, bill_id, document_type, recipient_email, event_key, status,
                      attempt_count, last_attempt_utc, sent_utc, failure_reason,
                      created_utc, updated_utc
            "#,
        )
        .bind(delivery_id)
        .bind(DeliveryStatus::Sent.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark delivery sent: {}", e))
        })?;
        Ok(record)
    }

    #[instrument(skip(self, reason))]
    pub async fn mark_delivery_failed(
        &self,
        delivery_id: Uuid,
        reason: &str,
    ) -> Result<DeliveryRecord, AppError> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            UPDATE delivery_records
            SET status = $2, attempt_count = attempt_count + 1, last_attempt_utc = now(),
                failure_reason = $3, updated_utc = now()
            WHERE delivery_id = $1
            RETURNING delivery_id, bill_id, document_type, recipient_email, event_key, status,
                      attempt_count, last_attempt_utc, sent_utc, failure_reason,
                      created_utc, updated_utc
            "#,
        )
        .bind(delivery_id)
        .bind(DeliveryStatus::Failed.as_str())
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark delivery failed: {}", e))
        })?;
        Ok(record)
    }

    /// Deliveries that should be back on the queue after a restart:
    /// enqueued-but-never-finished, plus failed ones with attempts left.
    #[instrument(skip(self))]
    pub async fn deliveries_for_recovery(
        &self,
        max_attempts: i32,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT delivery_id, bill_id, document_type, recipient_email, event_key, status,
                   attempt_count, last_attempt_utc, sent_utc, failure_reason,
                   created_utc, updated_utc
            FROM delivery_records
            WHERE status = 'pending' OR (status = 'failed' AND attempt_count < $1)
            ORDER BY created_utc
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load recovery set: {}", e))
        })?;
        Ok(records)
    }
}

/// Load and row-lock a bill for the duration of a callback transaction.
async fn lock_bill(conn: &mut PgConnection, bill_id: &str) -> Result<Option<Bill>, AppError> {
    let bill = sqlx::query_as::<_, Bill>(
        r#"
        SELECT id, bill_id, sys_code, dept_code, description, revenue_source, customer_id,
               amount, currency, status, cntrl_num, paid_before_payable, gen_date, expr_date,
               cancelled_utc, created_utc, updated_utc
        FROM bills WHERE bill_id = $1
        FOR UPDATE
        "#,
    )
    .bind(bill_id)
    .fetch_optional(conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock bill: {}", e)))?;
    Ok(bill)
}

/// Find-or-create the customer, keyed on email when present. Contact
/// details are refreshed from the latest submission.
async fn upsert_customer(
    conn: &mut PgConnection,
    input: NewCustomer,
) -> Result<Customer, AppError> {
    let query = if input.email.is_some() {
        // Keyed on email; contact details refresh on conflict.
        r#"
        INSERT INTO customers (customer_id, first_name, middle_name, last_name, cell_num, email)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (email) WHERE email IS NOT NULL DO UPDATE
        SET first_name = EXCLUDED.first_name, middle_name = EXCLUDED.middle_name,
            last_name = EXCLUDED.last_name, cell_num = EXCLUDED.cell_num, updated_utc = now()
        RETURNING customer_id, first_name, middle_name, last_name, cell_num, email,
                  created_utc, updated_utc
        "#
    } else {
        r#"
        INSERT INTO customers (customer_id, first_name, middle_name, last_name, cell_num, email)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING customer_id, first_name, middle_name, last_name, cell_num, email,
                  created_utc, updated_utc
        "#
    };

    let customer = sqlx::query_as::<_, Customer>(query)
        .bind(Uuid::new_v4())
        .bind(&input.first_name)
        .bind(&input.middle_name)
        .bind(&input.last_name)
        .bind(&input.cell_num)
        .bind(&input.email)
        .fetch_one(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Customer upsert failed: {}", e)))?;

    Ok(customer)
}
