//! Email sender over SMTP.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use herald_common::config::SmtpConfig;
use herald_common::error::AppError;

use crate::sender::Sender;

const SUBJECT: &str = "You have a new notification";

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, AppError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| AppError::Config(format!("invalid SMTP_FROM '{}': {}", config.from, e)))?;

        let mut builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| AppError::Config(format!("invalid SMTP host: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        builder = builder.port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        tracing::info!(host = %config.host, port = config.port, tls = config.tls, "Email sender configured");

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

/// Plain-text body wrapping the user's message.
fn render_body(message: &str) -> String {
    format!("Hello from Herald!\n\nYour notification:\n{}\n", message)
}

#[async_trait]
impl Sender for EmailSender {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), AppError> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| AppError::Delivery(format!("invalid email recipient '{}': {}", recipient, e)))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(render_body(message))
            .map_err(|e| AppError::Delivery(format!("failed to build email: {}", e)))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| AppError::Delivery(format!("SMTP send failed: {}", e)))?;

        tracing::debug!(recipient, "Email sent");
        Ok(())
    }
}
