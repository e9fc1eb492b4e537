use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub smtp: SmtpConfig,
    pub renderer: RendererConfig,
    pub delivery: DeliveryConfig,
    pub gateway: GatewayConfig,
    pub staff_token: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Base URL of the document renderer collaborator.
    pub url: String,
    pub timeout_secs: u64,
}

/// Recipient policy and retry bounds for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub customer_enabled: bool,
    pub payer_enabled: bool,
    pub allow_divergent_payer: bool,
    pub max_attempts: i32,
    pub retry_base_secs: u64,
    pub worker_count: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Absolute tolerance when comparing the billed amount reported by the
    /// gateway against the bill's amount.
    pub amount_tolerance: Decimal,
    /// Width of the submission dedup bucket, in seconds.
    pub submission_window_secs: i64,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        Ok(BillingConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("gepg-billing-service"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 1)?,
            },
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("localhost"), is_prod)?,
                port: parse_env("SMTP_PORT", 587)?,
                user: get_env("SMTP_USER", Some(""), is_prod)?,
                password: get_env("SMTP_PASSWORD", Some(""), is_prod)?,
                from_email: get_env("SMTP_FROM_EMAIL", Some("billing@example.go.tz"), is_prod)?,
                from_name: get_env("SMTP_FROM_NAME", Some("Billing"), is_prod)?,
                enabled: parse_env("SMTP_ENABLED", false)?,
            },
            renderer: RendererConfig {
                url: get_env("RENDERER_URL", Some("http://localhost:8090"), is_prod)?,
                timeout_secs: parse_env("RENDERER_TIMEOUT_SECS", 30)?,
            },
            delivery: DeliveryConfig {
                customer_enabled: parse_env("DELIVERY_CUSTOMER_ENABLED", true)?,
                payer_enabled: parse_env("DELIVERY_PAYER_ENABLED", false)?,
                allow_divergent_payer: parse_env("DELIVERY_ALLOW_DIVERGENT_PAYER", false)?,
                max_attempts: parse_env("DELIVERY_MAX_ATTEMPTS", 5)?,
                retry_base_secs: parse_env("DELIVERY_RETRY_BASE_SECS", 60)?,
                worker_count: parse_env("DELIVERY_WORKER_COUNT", 2)?,
                queue_size: parse_env("DELIVERY_QUEUE_SIZE", 256)?,
            },
            gateway: GatewayConfig {
                amount_tolerance: parse_env("GATEWAY_AMOUNT_TOLERANCE", Decimal::new(1, 2))?,
                submission_window_secs: parse_env("SUBMISSION_WINDOW_SECS", 600)?,
            },
            staff_token: get_env("STAFF_TOKEN", Some("dev-staff-token"), is_prod)?,
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(val) => val.parse::<T>().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, val))
        }),
        Err(_) => Ok(default),
    }
}
