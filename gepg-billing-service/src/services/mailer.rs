//! Outbound mail transport.
//!
//! The SMTP transport carries one PDF attachment per message. When SMTP is
//! disabled (local development) sends fail with a transport error and flow
//! through the ordinary retry bookkeeping.

use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use service_core::error::AppError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Attachment as (filename, bytes).
    pub attachment: Option<(String, Vec<u8>)>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), AppError>;
}

pub struct SmtpMailer {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self, AppError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| AppError::EmailError(format!("Failed to create SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    #[instrument(skip(self, message), fields(to = %message.to, subject = %message.subject))]
    async fn send(&self, message: &MailMessage) -> Result<(), AppError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| AppError::EmailError("SMTP transport is not enabled".to_string()))?;

        let from_mailbox: Mailbox =
            format!("{} <{}>", self.config.from_name, self.config.from_email)
                .parse()
                .map_err(|e| AppError::EmailError(format!("Invalid from address: {}", e)))?;

        let to_mailbox: Mailbox = message
            .to
            .parse()
            .map_err(|e| AppError::EmailError(format!("Invalid recipient: {}", e)))?;

        let builder = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(&message.subject);

        let body_part = SinglePart::builder()
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone());

        let email = match &message.attachment {
            Some((filename, bytes)) => {
                let attachment = Attachment::new(filename.clone()).body(
                    bytes.clone(),
                    "application/pdf"
                        .parse()
                        .map_err(|_| AppError::EmailError("Invalid content type".to_string()))?,
                );
                builder
                    .multipart(MultiPart::mixed().singlepart(body_part).singlepart(attachment))
                    .map_err(|e| AppError::EmailError(format!("Failed to build message: {}", e)))?
            }
            None => builder
                .singlepart(body_part)
                .map_err(|e| AppError::EmailError(format!("Failed to build message: {}", e)))?,
        };

        transport
            .send(email)
            .await
            .map_err(|e| AppError::EmailError(format!("Failed to send email: {}", e)))?;

        info!(to = %message.to, subject = %message.subject, "Email sent");
        Ok(())
    }
}

/// In-memory transport for tests: records sent messages and can be primed
/// to fail the next N sends to exercise retry handling.
#[derive(Default)]
pub struct MockMailer {
    sent: Mutex<Vec<MailMessage>>,
    fail_next: AtomicU64,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u64) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().expect("mailer mutex poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mailer mutex poisoned").len()
    }
}

#[async_trait]
impl MailTransport for MockMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), AppError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::EmailError("mock send failure".to_string()));
        }

        self.sent
            .lock()
            .expect("mailer mutex poisoned")
            .push(message.clone());

        info!(to = %message.to, subject = %message.subject, "[MOCK] Email recorded");
        Ok(())
    }
}
