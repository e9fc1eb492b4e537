//! HTTP handlers: gateway-facing callbacks, bill submission and status
//! polling, staff delivery tooling, and infrastructure probes.

pub mod bills;
pub mod callbacks;
pub mod deliveries;
pub mod health;
