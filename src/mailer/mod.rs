//! Outgoing mail
//!
//! Handlers never talk to a mail provider directly. They put an [`Email`] on the
//! [`MailQueue`]; the background [`MailWorker`] hands it to whichever
//! [`EmailSender`] `mailer.type` selected.

mod senders;
mod worker;

pub use senders::{DummyMailSender, SendGridSender, SendMailSender};
pub use worker::{channel, MailQueue, MailWorker, MailWorkerHandle};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("mail queue is closed")]
    QueueClosed,

    #[error("mail queue is full")]
    QueueFull,

    #[error("invalid mail address: {0}")]
    Address(String),

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("SendGrid delivery failed: {0}")]
    SendGrid(String),
}

/// Delivers a single message
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Discriminant this sender was selected by
    fn name(&self) -> &'static str;

    async fn send(&self, email: &Email) -> Result<(), MailError>;
}
