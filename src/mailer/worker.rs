//! Background mail delivery
//!
//! The worker is a supervised task: [`MailWorker::start`] spawns it and returns a
//! [`MailWorkerHandle`]. Stopping asks the worker to flush what is queued and
//! aborts it if it is still busy at the deadline.

use super::{Email, EmailSender, MailError};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Create the queue handlers enqueue on and the worker that drains it
pub fn channel(sender: Arc<dyn EmailSender>, capacity: usize) -> (MailQueue, MailWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MailQueue { tx }, MailWorker { rx, sender })
}

/// Cloneable producer side of the mail queue
#[derive(Clone, Debug)]
pub struct MailQueue {
    tx: mpsc::Sender<Email>,
}

impl MailQueue {
    /// Queue a message without waiting for room
    pub fn enqueue(&self, email: Email) -> Result<(), MailError> {
        self.tx.try_send(email).map_err(|e| match e {
            TrySendError::Full(_) => MailError::QueueFull,
            TrySendError::Closed(_) => MailError::QueueClosed,
        })
    }
}

pub struct MailWorker {
    rx: mpsc::Receiver<Email>,
    sender: Arc<dyn EmailSender>,
}

impl MailWorker {
    pub fn start(self) -> MailWorkerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));
        MailWorkerHandle {
            stop: stop_tx,
            task,
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        info!("Mail worker started, sender {}", self.sender.name());

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                next = self.rx.recv() => match next {
                    Some(email) => self.deliver(email).await,
                    None => {
                        info!("Mail queue dropped, mail worker exiting");
                        return;
                    }
                },
            }
        }

        // Refuse new mail, then deliver what is already queued
        self.rx.close();
        let mut flushed = 0usize;
        while let Some(email) = self.rx.recv().await {
            self.deliver(email).await;
            flushed += 1;
        }
        info!("Mail worker stopped, {} queued message(s) flushed", flushed);
    }

    async fn deliver(&self, email: Email) {
        if let Err(e) = self.sender.send(&email).await {
            error!(to = %email.to, subject = %email.subject, "Mail delivery failed: {}", e);
        }
    }
}

pub struct MailWorkerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MailWorkerHandle {
    /// Ask the worker to flush and exit, aborting it at `deadline`.
    ///
    /// Returns `true` when the worker finished on its own.
    pub async fn stop(self, deadline: Instant) -> bool {
        let Self { stop, mut task } = self;
        // The worker may already be gone, in which case the join below is immediate
        let _ = stop.send(());

        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Mail worker task failed: {}", e);
                true
            }
            Err(_) => {
                warn!("Mail worker still busy at the shutdown deadline, aborting it");
                task.abort();
                false
            }
        }
    }
}
