//! Idempotency ledger: the single synchronization primitive of the service.
//!
//! `record_if_new` attempts an atomic insert of a (scope, key) row and
//! reports whether this call created it. Under concurrent calls with the
//! same key, exactly one caller observes `true`. Callers run it inside the
//! same transaction as the state mutation it gates, so a failed mutation
//! also rolls the ledger row back.

use service_core::error::AppError;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;

/// Scope for the submission dedup bucket; gateway scopes live on
/// [`crate::models::CallbackKind::ledger_scope`].
pub const SCOPE_SUBMISSION: &str = "submission";

/// Insert the uniqueness row for (scope, key), returning whether this call
/// was the first sighting. Insert-and-catch-conflict, never a prior
/// existence check: an existence check would race.
pub async fn record_if_new(
    conn: &mut PgConnection,
    scope: &str,
    key: &str,
    payload_hash: Option<&str>,
    context: Option<&serde_json::Value>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO idempotency_ledger (scope, idem_key, payload_hash, outcome, context)
        VALUES ($1, $2, $3, 'accepted', $4)
        ON CONFLICT (scope, idem_key) DO NOTHING
        "#,
    )
    .bind(scope)
    .bind(key)
    .bind(payload_hash)
    .bind(context)
    .execute(conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Ledger insert failed: {}", e)))?;

    Ok(result.rows_affected() == 1)
}

/// Read back the context stored with an existing ledger row. Used by the
/// submission path to serve the original response to in-window duplicates.
pub async fn fetch_context(
    conn: &mut PgConnection,
    scope: &str,
    key: &str,
) -> Result<Option<serde_json::Value>, AppError> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        "SELECT context FROM idempotency_ledger WHERE scope = $1 AND idem_key = $2",
    )
    .bind(scope)
    .bind(key)
    .fetch_optional(conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Ledger lookup failed: {}", e)))?;

    Ok(row.and_then(|(ctx,)| ctx))
}

/// Backfill context onto a ledger row created earlier in the same
/// transaction, once the dependent state (bill, request id) exists.
pub async fn store_context(
    conn: &mut PgConnection,
    scope: &str,
    key: &str,
    context: &serde_json::Value,
) -> Result<(), AppError> {
    sqlx::query("UPDATE idempotency_ledger SET context = $3 WHERE scope = $1 AND idem_key = $2")
        .bind(scope)
        .bind(key)
        .bind(context)
        .execute(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Ledger update failed: {}", e)))?;
    Ok(())
}

/// Hex SHA-256 of a payload, recorded alongside ledger and audit rows so
/// replays can be distinguished from identifier reuse during diagnosis.
pub fn payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_is_stable_and_content_sensitive() {
        let a = payload_hash(b"{\"bill_id\":\"B1\"}");
        let b = payload_hash(b"{\"bill_id\":\"B1\"}");
        let c = payload_hash(b"{\"bill_id\":\"B2\"}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
