//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::handlers::{
    bills::{cancel_bill, control_number_status, submit_bill},
    callbacks::{control_number_callback, payment_callback},
    deliveries::{list_deliveries, resend_delivery, staff_auth_middleware},
    health::{health_check, metrics_handler, readiness_check},
};
use crate::services::{
    init_metrics, Database, DeliveryJob, HttpRenderer, MailTransport, NotificationEngine,
    SmtpMailer,
};
use crate::services::renderer::DocumentRenderer;
use crate::workers::{run_recovery_sweep, DeliveryOrchestrator, DeliverySender};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub db: Arc<Database>,
    pub engine: Arc<NotificationEngine>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    orchestrator: DeliveryOrchestrator,
    job_tx: mpsc::Sender<DeliveryJob>,
}

impl Application {
    /// Build the application with production collaborators.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        let mailer: Arc<dyn MailTransport> = Arc::new(SmtpMailer::new(config.smtp.clone())?);
        let renderer: Arc<dyn DocumentRenderer> = Arc::new(HttpRenderer::new(
            &config.renderer.url,
            config.renderer.timeout_secs,
        )?);
        Self::build_with_collaborators(config, mailer, renderer).await
    }

    /// Build with injected mail and renderer collaborators. Tests use this
    /// to observe sends without network access.
    pub async fn build_with_collaborators(
        config: BillingConfig,
        mailer: Arc<dyn MailTransport>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let sender = Arc::new(DeliverySender::new(
            db.clone(),
            mailer,
            renderer,
            config.delivery.clone(),
        ));
        let (orchestrator, job_tx) =
            DeliveryOrchestrator::new(config.delivery.clone(), sender);

        let engine = Arc::new(NotificationEngine::new(
            db.clone(),
            job_tx.clone(),
            config.delivery.clone(),
        ));

        let state = AppState {
            config: config.clone(),
            db: Arc::new(db),
            engine,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Billing service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            orchestrator,
            job_tx,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.orchestrator.start().await;

        // Requeue deliveries stranded by a previous process.
        if let Err(e) = run_recovery_sweep(
            &self.state.db,
            &self.job_tx,
            self.state.config.delivery.max_attempts,
        )
        .await
        {
            tracing::error!(error = %e, "Delivery recovery sweep failed");
        }

        let internal_routes = Router::new()
            .route("/internal/billing/bills/:bill_id/deliveries", get(list_deliveries))
            .route(
                "/internal/billing/bills/:bill_id/deliveries/resend",
                post(resend_delivery),
            )
            .route("/internal/billing/bills/:bill_id/cancel", post(cancel_bill))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                staff_auth_middleware,
            ));

        let router = Router::new()
            .route("/bill-submission", post(submit_bill))
            .route(
                "/bill-cntrl-num-response-callback",
                post(control_number_callback),
            )
            .route("/bill-cntrl-num-payment-callback", post(payment_callback))
            .route(
                "/bill/:bill_id/control-number-status",
                get(control_number_status),
            )
            .merge(internal_routes)
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state);

        tracing::info!(
            service = "gepg-billing-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}
