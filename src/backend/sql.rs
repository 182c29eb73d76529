//! SQL store over a `sqlx` `AnyPool`
//!
//! One store serves MySQL and SQLite. The pool is created lazily, so building
//! the store does no I/O; the first query opens the first connection.

use super::queries;
use super::repository::*;
use crate::config::DatabaseSettings;
use crate::error::BootstrapError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SQLITE_MEMORY: &str = ":memory:";
const MYSQL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SqlStore {
    pool: AnyPool,
    backend: &'static str,
}

impl SqlStore {
    pub fn mysql(settings: &DatabaseSettings) -> Result<Self, BootstrapError> {
        let mysql = &settings.mysql;
        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            mysql.user, mysql.password, mysql.host, mysql.port, mysql.database
        );
        // sqlx has no idle-count cap; idle connections are closed by age instead
        let options = AnyPoolOptions::new()
            .max_connections(mysql.max_open.max(1))
            .idle_timeout(Some(MYSQL_IDLE_TIMEOUT));

        info!(
            "Using MySQL store at {}:{}/{} (max open {})",
            mysql.host, mysql.port, mysql.database, mysql.max_open
        );
        info!(
            "    db.mysql.maxidle={} is not a pool limit here, idle connections close after {}",
            mysql.max_idle,
            humantime::format_duration(MYSQL_IDLE_TIMEOUT)
        );
        Self::connect_lazy("MYSQL", &url, options)
    }

    pub fn sqlite(settings: &DatabaseSettings) -> Result<Self, BootstrapError> {
        let path = settings.sqlite_path.trim();
        if path.is_empty() {
            return Err(BootstrapError::Backend {
                backend: "SQLITE",
                reason: "db.sqlite.path must not be empty".to_string(),
            });
        }

        // An in-memory database lives and dies with its connection
        let (url, options) = if path == SQLITE_MEMORY {
            (
                "sqlite::memory:".to_string(),
                AnyPoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None),
            )
        } else {
            (
                format!("sqlite://{}?mode=rwc", path),
                AnyPoolOptions::new().max_connections(4),
            )
        };

        info!("Using SQLite store at {}", path);
        Self::connect_lazy("SQLITE", &url, options)
    }

    fn connect_lazy(
        backend: &'static str,
        url: &str,
        options: AnyPoolOptions,
    ) -> Result<Self, BootstrapError> {
        sqlx::any::install_default_drivers();
        let pool = options
            .connect_lazy(url)
            .map_err(|e| BootstrapError::Backend {
                backend,
                reason: e.to_string(),
            })?;
        Ok(Self { pool, backend })
    }

    /// Discriminant this store was built for
    #[cfg(test)]
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    #[cfg(test)]
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

fn user_from_row(row: &AnyRow) -> Result<User, sqlx::Error> {
    Ok(User {
        rec_id: row.try_get("REC_ID")?,
        email: row.try_get("EMAIL")?,
        pass_phrase: row.try_get("HASHED_PASSPHRASE")?,
        enabled: row.try_get::<i64, _>("ENABLED")? != 0,
        suspended: row.try_get::<i64, _>("SUSPENDED")? != 0,
    })
}

fn group_from_row(row: &AnyRow) -> Result<Group, sqlx::Error> {
    Ok(Group {
        rec_id: row.try_get(0)?,
        group_name: row.try_get(1)?,
        group_domain: row.try_get(2)?,
        description: row.try_get(3)?,
    })
}

fn role_from_row(row: &AnyRow) -> Result<Role, sqlx::Error> {
    Ok(Role {
        rec_id: row.try_get(0)?,
        role_name: row.try_get(1)?,
        role_domain: row.try_get(2)?,
        description: row.try_get(3)?,
    })
}

fn tenant_from_row(row: &AnyRow) -> Result<Tenant, sqlx::Error> {
    Ok(Tenant {
        rec_id: row.try_get(0)?,
        name: row.try_get(1)?,
        domain: row.try_get(2)?,
        description: row.try_get(3)?,
    })
}

#[async_trait]
impl UserRepository for SqlStore {
    async fn get_user_by_rec_id(&self, rec_id: &str) -> RepoResult<Option<User>> {
        sqlx::query(queries::USER_BY_REC_ID)
            .bind(rec_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        sqlx::query(queries::USER_BY_EMAIL)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }
}

#[async_trait]
impl GroupRepository for SqlStore {
    async fn get_group_by_rec_id(&self, rec_id: &str) -> RepoResult<Option<Group>> {
        sqlx::query(queries::GROUP_BY_REC_ID)
            .bind(rec_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(group_from_row)
            .transpose()
    }
}

#[async_trait]
impl RoleRepository for SqlStore {
    async fn get_role_by_rec_id(&self, rec_id: &str) -> RepoResult<Option<Role>> {
        sqlx::query(queries::ROLE_BY_REC_ID)
            .bind(rec_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(role_from_row)
            .transpose()
    }
}

#[async_trait]
impl UserGroupRepository for SqlStore {
    async fn list_user_groups(&self, user_rec_id: &str) -> RepoResult<Vec<Group>> {
        sqlx::query(queries::GROUPS_OF_USER)
            .bind(user_rec_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(group_from_row)
            .collect()
    }
}

#[async_trait]
impl UserRoleRepository for SqlStore {
    async fn list_user_roles(&self, user_rec_id: &str) -> RepoResult<Vec<Role>> {
        sqlx::query(queries::ROLES_OF_USER)
            .bind(user_rec_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(role_from_row)
            .collect()
    }
}

#[async_trait]
impl GroupRoleRepository for SqlStore {
    async fn list_group_roles(&self, group_rec_id: &str) -> RepoResult<Vec<Role>> {
        sqlx::query(queries::ROLES_OF_GROUP)
            .bind(group_rec_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(role_from_row)
            .collect()
    }
}

#[async_trait]
impl TenantRepository for SqlStore {
    async fn get_tenant_by_domain(&self, domain: &str) -> RepoResult<Option<Tenant>> {
        sqlx::query(queries::TENANT_BY_DOMAIN)
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(tenant_from_row)
            .transpose()
    }
}

#[async_trait]
impl RevocationRepository for SqlStore {
    async fn revoke(&self, jti: Uuid, expires_at: i64) -> RepoResult<bool> {
        // Expired tokens fail validation anyway, their rows are dead weight
        let purged = sqlx::query(queries::PURGE_EXPIRED_REVOCATIONS)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            debug!(store = self.backend, purged, "expired revocations purged");
        }

        let inserted = sqlx::query(queries::REVOKE_TOKEN)
            .bind(jti.to_string())
            .bind(expires_at)
            .execute(&self.pool)
            .await;
        match inserted {
            Ok(_) => {
                debug!(store = self.backend, %jti, "token revoked");
                Ok(true)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_revoked(&self, jti: Uuid) -> RepoResult<bool> {
        let row = sqlx::query(queries::IS_REVOKED)
            .bind(jti.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("CNT")? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::seeded_store;
    use crate::config::Settings;

    #[tokio::test]
    async fn test_user_lookups() {
        let store = seeded_store("hash").await;

        let user = store.get_user_by_email("jane@aaa.test").await.unwrap().unwrap();
        assert_eq!(store.backend(), "SQLITE");
        assert_eq!(user.rec_id, "u1");
        assert!(user.is_active());

        assert_eq!(store.get_user_by_rec_id("u1").await.unwrap(), Some(user));
        assert!(store.get_user_by_email("nobody@aaa.test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_role_resolution_through_groups() {
        let store = seeded_store("hash").await;

        let direct = store.list_user_roles("u1").await.unwrap();
        assert_eq!(direct[0].qualified_name(), "admin@aaa");

        let groups = store.list_user_groups("u1").await.unwrap();
        assert_eq!(groups.len(), 1);
        let via_group = store.list_group_roles(&groups[0].rec_id).await.unwrap();
        assert_eq!(via_group[0].qualified_name(), "auditor@aaa");

        assert!(store.get_tenant_by_domain("aaa").await.unwrap().is_some());
        assert!(store.get_role_by_rec_id("r9").await.unwrap().is_none());
        assert!(store.get_group_by_rec_id("g1").await.unwrap().is_some());
    }

    fn in_an_hour() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn test_revocation() {
        let store = seeded_store("hash").await;
        let jti = Uuid::new_v4();

        assert!(!store.is_revoked(jti).await.unwrap());
        assert!(store.revoke(jti, in_an_hour()).await.unwrap());
        assert!(store.is_revoked(jti).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_revoke_reports_already_revoked() {
        let store = seeded_store("hash").await;
        let jti = Uuid::new_v4();

        assert!(store.revoke(jti, in_an_hour()).await.unwrap());
        assert!(!store.revoke(jti, in_an_hour()).await.unwrap());
        assert!(store.is_revoked(jti).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_revocations_are_purged() {
        let store = seeded_store("hash").await;
        let expired = Uuid::new_v4();
        let live = Uuid::new_v4();

        assert!(store.revoke(expired, 0).await.unwrap());
        assert!(store.revoke(live, in_an_hour()).await.unwrap());

        assert!(!store.is_revoked(expired).await.unwrap());
        assert!(store.is_revoked(live).await.unwrap());
    }

    #[tokio::test]
    async fn test_mysql_pool_stays_lazy() {
        let mut settings = Settings::from_overrides(&[]).unwrap().database;
        settings.mysql.max_open = 8;
        settings.mysql.max_idle = 4;

        let store = SqlStore::mysql(&settings).unwrap();
        let options = store.pool().options();
        assert_eq!(options.get_min_connections(), 0);
        assert_eq!(options.get_max_connections(), 8);
        assert_eq!(options.get_idle_timeout(), Some(MYSQL_IDLE_TIMEOUT));
        assert_eq!(store.pool().size(), 0);
    }

    #[tokio::test]
    async fn test_empty_sqlite_path_is_rejected() {
        let mut settings = Settings::from_overrides(&[]).unwrap().database;
        settings.sqlite_path = " ".to_string();
        assert!(SqlStore::sqlite(&settings).is_err());
    }
}
