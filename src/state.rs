//! Application state management
//!
//! Everything handlers share. Built once by the lifecycle manager from the
//! selected backends and the token factory; read-only afterwards.

use crate::auth::TokenFactory;
use crate::backend::Persistence;
use crate::mailer::MailQueue;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Repository capabilities, all served by the store `db.type` selected
    pub store: Persistence,

    /// Token issuance and validation
    pub tokens: Arc<TokenFactory>,

    /// Producer side of the background mail queue
    pub mail: MailQueue,
}

impl AppState {
    pub fn new(store: Persistence, tokens: Arc<TokenFactory>, mail: MailQueue) -> Self {
        Self { store, tokens, mail }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
