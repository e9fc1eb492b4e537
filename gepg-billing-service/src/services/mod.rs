pub mod database;
pub mod ledger;
pub mod mailer;
pub mod metrics;
pub mod notifications;
pub mod recipients;
pub mod renderer;

pub use database::Database;
pub use mailer::{MailMessage, MailTransport, MockMailer, SmtpMailer};
pub use metrics::{get_metrics, init_metrics};
pub use notifications::{DeliveryJob, NotificationEngine};
pub use renderer::{DocumentRenderer, HttpRenderer, MockRenderer, RenderRequest};
