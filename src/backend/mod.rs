//! Backend selection
//!
//! `db.type` and `mailer.type` are discriminants looked up in a
//! [`BackendRegistry`]. Each registry entry builds one shared instance; the
//! persistence instance is bound to all eight repository capabilities.

mod queries;
mod repository;
mod sql;

pub use repository::*;
pub use sql::SqlStore;

use crate::config::{env_var_name, DatabaseSettings, MailerSettings, Settings};
use crate::error::{describe_accepted, BootstrapError};
use crate::mailer::{DummyMailSender, EmailSender, SendGridSender, SendMailSender};
use std::sync::Arc;
use tracing::info;

/// Discriminant-keyed constructors for one capability
pub struct BackendRegistry<F> {
    capability: &'static str,
    key: &'static str,
    entries: Vec<(&'static str, F)>,
}

impl<F> BackendRegistry<F> {
    pub fn new(capability: &'static str, key: &'static str) -> Self {
        Self {
            capability,
            key,
            entries: Vec::new(),
        }
    }

    pub fn register(mut self, discriminant: &'static str, factory: F) -> Self {
        self.entries.push((discriminant, factory));
        self
    }

    pub fn accepted(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    /// Look up the constructor for `value`; unknown values are fatal
    pub fn resolve(&self, value: &str) -> Result<&F, BootstrapError> {
        self.entries
            .iter()
            .find(|(name, _)| *name == value)
            .map(|(_, factory)| factory)
            .ok_or_else(|| BootstrapError::UnknownBackend {
                capability: self.capability,
                key: self.key,
                value: value.to_string(),
                env_var: env_var_name(self.key),
                accepted: describe_accepted(&self.accepted()),
            })
    }
}

pub type StoreFactory = fn(&DatabaseSettings) -> Result<Persistence, BootstrapError>;
pub type MailerFactory = fn(&MailerSettings) -> Result<Arc<dyn EmailSender>, BootstrapError>;

pub fn store_registry() -> BackendRegistry<StoreFactory> {
    BackendRegistry::<StoreFactory>::new("database", "db.type")
        .register("MYSQL", |settings| {
            Ok(Persistence::from_store(Arc::new(SqlStore::mysql(settings)?)))
        })
        .register("SQLITE", |settings| {
            Ok(Persistence::from_store(Arc::new(SqlStore::sqlite(settings)?)))
        })
}

pub fn mailer_registry() -> BackendRegistry<MailerFactory> {
    BackendRegistry::<MailerFactory>::new("mailer", "mailer.type")
        .register("DUMMY", |_| Ok(Arc::new(DummyMailSender)))
        .register("SENDMAIL", |settings| Ok(Arc::new(SendMailSender::new(settings)?)))
        .register("SENDGRID", |settings| Ok(Arc::new(SendGridSender::new(settings)?)))
}

/// Every persistence capability, each pointing at the selected store
#[derive(Clone)]
pub struct Persistence {
    pub users: Arc<dyn UserRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub user_groups: Arc<dyn UserGroupRepository>,
    pub user_roles: Arc<dyn UserRoleRepository>,
    pub group_roles: Arc<dyn GroupRoleRepository>,
    pub tenants: Arc<dyn TenantRepository>,
    pub revocations: Arc<dyn RevocationRepository>,
}

impl Persistence {
    pub fn from_store<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            users: store.clone(),
            groups: store.clone(),
            roles: store.clone(),
            user_groups: store.clone(),
            user_roles: store.clone(),
            group_roles: store.clone(),
            tenants: store.clone(),
            revocations: store,
        }
    }
}

/// The backends selected for this process
#[derive(Clone)]
pub struct BackendBinding {
    pub persistence: Persistence,
    pub email_sender: Arc<dyn EmailSender>,
}

impl BackendBinding {
    /// Resolve `db.type` and `mailer.type`, constructing one instance of each.
    ///
    /// Both discriminants are checked before anything is constructed.
    pub fn select(settings: &Settings) -> Result<Self, BootstrapError> {
        let stores = store_registry();
        let mailers = mailer_registry();
        let make_store = stores.resolve(&settings.database.kind)?;
        let make_mailer = mailers.resolve(&settings.mailer.kind)?;

        let persistence = make_store(&settings.database)?;
        let email_sender = make_mailer(&settings.mailer)?;

        info!(
            "Backends selected: database {}, mailer {}",
            settings.database.kind, settings.mailer.kind
        );
        Ok(Self {
            persistence,
            email_sender,
        })
    }
}
