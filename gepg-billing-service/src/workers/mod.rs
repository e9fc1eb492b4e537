pub mod composer;
pub mod orchestrator;
pub mod sender;

pub use orchestrator::{run_recovery_sweep, DeliveryOrchestrator};
pub use sender::DeliverySender;
