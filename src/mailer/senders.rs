//! Concrete mail senders

use super::{Email, EmailSender, MailError};
use crate::config::MailerSettings;
use crate::error::BootstrapError;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";
const SENDGRID_TIMEOUT: Duration = Duration::from_secs(10);

/// Logs mail instead of sending it
#[derive(Debug, Default)]
pub struct DummyMailSender;

#[async_trait]
impl EmailSender for DummyMailSender {
    fn name(&self) -> &'static str {
        "DUMMY"
    }

    async fn send(&self, email: &Email) -> Result<(), MailError> {
        info!(to = %email.to, subject = %email.subject, "Dummy mail sender, not delivering");
        debug!("{}", email.body);
        Ok(())
    }
}

/// SMTP relay with STARTTLS
pub struct SendMailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SendMailSender {
    pub fn new(settings: &MailerSettings) -> Result<Self, BootstrapError> {
        let smtp = &settings.sendmail;
        let from = sender_mailbox(settings)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
            .map_err(|e| BootstrapError::Backend {
                backend: "SENDMAIL",
                reason: e.to_string(),
            })?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.user.clone(), smtp.password.clone()))
            .build();

        info!("Using SMTP relay {}:{} as {}", smtp.host, smtp.port, from);
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl EmailSender for SendMailSender {
    fn name(&self) -> &'static str {
        "SENDMAIL"
    }

    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let to = email
            .to
            .parse::<Address>()
            .map_err(|e| MailError::Address(format!("{}: {}", email.to, e)))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, to))
            .subject(email.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(email.body.clone())
            .map_err(|e| MailError::Smtp(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Smtp(e.to_string()))?;
        Ok(())
    }
}

/// SendGrid v3 HTTP API
pub struct SendGridSender {
    client: reqwest::Client,
    token: String,
    from: String,
    from_name: String,
}

impl SendGridSender {
    pub fn new(settings: &MailerSettings) -> Result<Self, BootstrapError> {
        if settings.sendgrid_token.trim().is_empty() {
            return Err(BootstrapError::Backend {
                backend: "SENDGRID",
                reason: "mailer.sendgrid.token must be set".to_string(),
            });
        }
        sender_mailbox(settings)?;

        let client = reqwest::Client::builder()
            .timeout(SENDGRID_TIMEOUT)
            .build()
            .map_err(|e| BootstrapError::Backend {
                backend: "SENDGRID",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            token: settings.sendgrid_token.trim().to_string(),
            from: settings.from.clone(),
            from_name: settings.from_name.clone(),
        })
    }
}

#[async_trait]
impl EmailSender for SendGridSender {
    fn name(&self) -> &'static str {
        "SENDGRID"
    }

    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let payload = json!({
            "personalizations": [{ "to": [{ "email": email.to }] }],
            "from": { "email": self.from, "name": self.from_name },
            "subject": email.subject,
            "content": [{ "type": "text/html", "value": email.body }],
        });

        let response = self
            .client
            .post(SENDGRID_ENDPOINT)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailError::SendGrid(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::SendGrid(format!("{}: {}", status, body)));
        }
        Ok(())
    }
}

fn sender_mailbox(settings: &MailerSettings) -> Result<Mailbox, BootstrapError> {
    let address = settings
        .from
        .parse::<Address>()
        .map_err(|e| BootstrapError::Backend {
            backend: "mailer",
            reason: format!("mailer.from.address '{}': {}", settings.from, e),
        })?;
    Ok(Mailbox::new(Some(settings.from_name.clone()), address))
}
