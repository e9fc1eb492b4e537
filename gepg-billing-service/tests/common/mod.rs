//! Test helper module for gepg-billing-service integration tests.
//!
//! Provides PostgreSQL-backed setup with schema-per-test isolation and
//! mock mail/renderer collaborators. Tests skip themselves when
//! TEST_DATABASE_URL is not set.

#![allow(dead_code)]

use gepg_billing_service::config::{
    BillingConfig, DatabaseConfig, DeliveryConfig, GatewayConfig, RendererConfig, SmtpConfig,
};
use gepg_billing_service::models::DeliveryRecord;
use gepg_billing_service::services::{Database, MockMailer, MockRenderer};
use gepg_billing_service::startup::Application;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use service_core::config::Config as CoreConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_STAFF_TOKEN: &str = "test-staff-token";

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Get the database URL for testing, or None to skip the test.
pub fn get_test_database_url() -> Option<String> {
    match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set, skipping integration test");
            None
        }
    }
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_gepg_{}_{}", std::process::id(), counter)
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub db: Database,
    pub mailer: Arc<MockMailer>,
    pub renderer: Arc<MockRenderer>,
    schema_name: String,
}

impl TestApp {
    /// Spawn a test application on a random port, or None when no test
    /// database is configured.
    pub async fn spawn() -> Option<Self> {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a config tweak, e.g. recipient policy or retry bounds.
    pub async fn spawn_with(configure: impl FnOnce(&mut BillingConfig)) -> Option<Self> {
        let base_url = get_test_database_url()?;
        let schema_name = unique_schema_name();

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");
        pool.close().await;

        let separator = if base_url.contains('?') { "&" } else { "?" };
        let db_url_with_schema = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let mut config = BillingConfig {
            common: CoreConfig {
                port: 0, // Random port
                log_level: "warn".to_string(),
            },
            service_name: "gepg-billing-service-test".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: db_url_with_schema.clone(),
                max_connections: 5,
                min_connections: 1,
            },
            smtp: SmtpConfig {
                host: "localhost".to_string(),
                port: 2525,
                user: String::new(),
                password: String::new(),
                from_email: "billing@example.go.tz".to_string(),
                from_name: "Billing".to_string(),
                enabled: false,
            },
            renderer: RendererConfig {
                url: "http://localhost:1".to_string(), // Never called, mock injected
                timeout_secs: 1,
            },
            delivery: DeliveryConfig {
                customer_enabled: true,
                payer_enabled: false,
                allow_divergent_payer: false,
                max_attempts: 5,
                retry_base_secs: 0, // Immediate retries in tests
                worker_count: 2,
                queue_size: 64,
            },
            gateway: GatewayConfig {
                amount_tolerance: Decimal::new(1, 2),
                submission_window_secs: 600,
            },
            staff_token: TEST_STAFF_TOKEN.to_string(),
        };
        configure(&mut config);

        let mailer = Arc::new(MockMailer::new());
        let renderer = Arc::new(MockRenderer::new());

        let app =
            Application::build_with_collaborators(config, mailer.clone(), renderer.clone())
                .await
                .expect("Failed to build test application");

        let port = app.port();
        let db = Database::new(&db_url_with_schema, 5, 1)
            .await
            .expect("Failed to create test database handle");

        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to accept connections.
        let client = reqwest::Client::new();
        let health_url = format!("http://127.0.0.1:{}/health", port);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Some(TestApp {
            address,
            port,
            db,
            mailer,
            renderer,
            schema_name,
        })
    }

    /// Submit a bill and return (status, body).
    pub async fn submit_bill(&self, amount: f64, email: Option<&str>) -> (u16, Value) {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/bill-submission", self.address))
            .json(&json!({
                "sys_code": "NIMR",
                "bill_dept": "HQ01",
                "description": "Research clearance fee",
                "revenue_source": "Research Clearance",
                "currency": "TZS",
                "amount": amount,
                "customer": {
                    "first_name": "Asha",
                    "last_name": "Mushi",
                    "email": email,
                }
            }))
            .send()
            .await
            .expect("Failed to submit bill");
        let status = response.status().as_u16();
        let body = response.json().await.expect("Invalid submission response");
        (status, body)
    }

    /// Submit a bill and return its bill id, asserting creation succeeded.
    pub async fn issue_bill(&self, amount: f64, email: Option<&str>) -> String {
        let (status, body) = self.submit_bill(amount, email).await;
        assert_eq!(status, 201, "bill submission failed: {}", body);
        body["bill_id"].as_str().expect("missing bill_id").to_string()
    }

    pub async fn control_number_callback(
        &self,
        req_id: &str,
        bill_id: &str,
        cntrl_num: i64,
        bill_amt: f64,
    ) -> (u16, Value) {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/bill-cntrl-num-response-callback", self.address))
            .json(&json!({
                "req_id": req_id,
                "bill_id": bill_id,
                "cntrl_num": cntrl_num,
                "bill_amt": bill_amt,
            }))
            .send()
            .await
            .expect("Failed to post control-number callback");
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn payment_callback(
        &self,
        bill_id: &str,
        trx_id: &str,
        paid_amt: f64,
        pyr_email: Option<&str>,
    ) -> (u16, Value) {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/bill-cntrl-num-payment-callback", self.address))
            .json(&json!({
                "bill_id": bill_id,
                "trx_id": trx_id,
                "payref_id": format!("REF-{}", trx_id),
                "paid_amt": paid_amt,
                "paid_ccy": "TZS",
                "pay_channel": "MPESA",
                "trx_date": "2026-08-01T10:00:00Z",
                "pyr_name": "Asha Mushi",
                "pyr_email": pyr_email,
            }))
            .send()
            .await
            .expect("Failed to post payment callback");
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Poll until every delivery record for the bill reaches a terminal
    /// status or the timeout elapses. Returns the records.
    pub async fn wait_for_deliveries_settled(&self, bill_id: &str) -> Vec<DeliveryRecord> {
        for _ in 0..100 {
            let records = self
                .db
                .list_deliveries(bill_id)
                .await
                .expect("Failed to list deliveries");
            let settled = !records.is_empty()
                && records
                    .iter()
                    .all(|r| matches!(r.status.as_str(), "sent" | "not_sent") || r.attempt_count >= 5);
            if settled {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.db
            .list_deliveries(bill_id)
            .await
            .expect("Failed to list deliveries")
    }

    /// Staff request helper carrying the internal token.
    pub fn staff_client(&self) -> reqwest::Client {
        reqwest::Client::new()
    }

    pub async fn cleanup(&self) {
        if let Some(base_url) = get_test_database_url() {
            if let Ok(pool) = sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect(&base_url)
                .await
            {
                let _ = sqlx::query(&format!(
                    "DROP SCHEMA IF EXISTS {} CASCADE",
                    self.schema_name
                ))
                .execute(&pool)
                .await;
                pool.close().await;
            }
        }
    }
}
