//! Persistence capabilities
//!
//! Each capability is a narrow async trait. Handlers only ever see these traits;
//! which store implements them is decided once, by `db.type`.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

pub type RepoResult<T> = Result<T, sqlx::Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub rec_id: String,
    pub email: String,
    pub pass_phrase: String,
    pub enabled: bool,
    pub suspended: bool,
}

impl User {
    /// Whether the account may sign in
    pub fn is_active(&self) -> bool {
        self.enabled && !self.suspended
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub rec_id: String,
    pub group_name: String,
    pub group_domain: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub rec_id: String,
    pub role_name: String,
    pub role_domain: String,
    pub description: String,
}

impl Role {
    /// `name@domain`, the form carried in token claims
    pub fn qualified_name(&self) -> String {
        format!("{}@{}", self.role_name, self.role_domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub rec_id: String,
    pub name: String,
    pub domain: String,
    pub description: String,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_user_by_rec_id(&self, rec_id: &str) -> RepoResult<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> RepoResult<Option<User>>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get_group_by_rec_id(&self, rec_id: &str) -> RepoResult<Option<Group>>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn get_role_by_rec_id(&self, rec_id: &str) -> RepoResult<Option<Role>>;
}

#[async_trait]
pub trait UserGroupRepository: Send + Sync {
    async fn list_user_groups(&self, user_rec_id: &str) -> RepoResult<Vec<Group>>;
}

#[async_trait]
pub trait UserRoleRepository: Send + Sync {
    async fn list_user_roles(&self, user_rec_id: &str) -> RepoResult<Vec<Role>>;
}

#[async_trait]
pub trait GroupRoleRepository: Send + Sync {
    async fn list_group_roles(&self, group_rec_id: &str) -> RepoResult<Vec<Role>>;
}

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn get_tenant_by_domain(&self, domain: &str) -> RepoResult<Option<Tenant>>;
}

/// Revoked token ids, checked before any token is honored
#[async_trait]
pub trait RevocationRepository: Send + Sync {
    /// Record `jti` as revoked until `expires_at`. Returns `false` when it
    /// already was, so a token can be spent exactly once.
    async fn revoke(&self, jti: Uuid, expires_at: i64) -> RepoResult<bool>;
    async fn is_revoked(&self, jti: Uuid) -> RepoResult<bool>;
}

/// A store able to serve every persistence capability
pub trait Store:
    UserRepository
    + GroupRepository
    + RoleRepository
    + UserGroupRepository
    + UserRoleRepository
    + GroupRoleRepository
    + TenantRepository
    + RevocationRepository
{
}

impl<T> Store for T where
    T: UserRepository
        + GroupRepository
        + RoleRepository
        + UserGroupRepository
        + UserRoleRepository
        + GroupRoleRepository
        + TenantRepository
        + RevocationRepository
{
}
