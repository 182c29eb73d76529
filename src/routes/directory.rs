//! Directory lookups
//!
//! Read-only access to groups, roles and tenants for authenticated callers.

use crate::auth::Claims;
use crate::backend::{Group, Role, Tenant};
use crate::error::{ApiResult, AppError};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub success: bool,
    pub data: T,
}

fn found<T>(data: Option<T>, what: &str, key: &str) -> ApiResult<Json<DataResponse<T>>> {
    data.map(|data| Json(DataResponse { success: true, data }))
        .ok_or_else(|| AppError::NotFound(format!("{} {} not found", what, key)))
}

/// GET /api/v1/groups/{rec_id}
pub async fn get_group(
    State(state): State<SharedState>,
    caller: Claims,
    Path(rec_id): Path<String>,
) -> ApiResult<Json<DataResponse<Group>>> {
    debug!(subject = %caller.sub, "Getting group: {}", rec_id);
    let group = state.store.groups.get_group_by_rec_id(&rec_id).await?;
    found(group, "Group", &rec_id)
}

/// GET /api/v1/roles/{rec_id}
pub async fn get_role(
    State(state): State<SharedState>,
    caller: Claims,
    Path(rec_id): Path<String>,
) -> ApiResult<Json<DataResponse<Role>>> {
    debug!(subject = %caller.sub, "Getting role: {}", rec_id);
    let role = state.store.roles.get_role_by_rec_id(&rec_id).await?;
    found(role, "Role", &rec_id)
}

/// GET /api/v1/tenants/{domain}
pub async fn get_tenant(
    State(state): State<SharedState>,
    caller: Claims,
    Path(domain): Path<String>,
) -> ApiResult<Json<DataResponse<Tenant>>> {
    debug!(subject = %caller.sub, "Getting tenant: {}", domain);
    let tenant = state.store.tenants.get_tenant_by_domain(&domain).await?;
    found(tenant, "Tenant", &domain)
}
