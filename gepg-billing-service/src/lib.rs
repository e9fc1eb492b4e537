//! GEPG billing service: bill issuance against the government payment
//! gateway, idempotent callback ingestion, and notification delivery.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
