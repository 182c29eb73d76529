//! Authentication route handlers
//!
//! Provides authenticate, refresh, logout, whoami and passphrase recovery.

use crate::auth::{verify_passphrase, Claims, TokenPair, TokenType};
use crate::backend::{Persistence, User};
use crate::error::{ApiResult, AppError};
use crate::mailer::Email;
use crate::state::SharedState;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

// ============================================
// Request/Response Types
// ============================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub email: String,
    pub passphrase: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RecoverRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub success: bool,
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoAmIResponse {
    pub success: bool,
    pub subject: String,
    pub roles: Vec<String>,
    pub expires_at: i64,
}

// ============================================
// Helpers
// ============================================

/// Qualified names of the roles held directly or through a group, sorted
async fn resolve_roles(store: &Persistence, user: &User) -> ApiResult<Vec<String>> {
    let mut roles: BTreeSet<String> = store
        .user_roles
        .list_user_roles(&user.rec_id)
        .await?
        .iter()
        .map(|role| role.qualified_name())
        .collect();

    for group in store.user_groups.list_user_groups(&user.rec_id).await? {
        for role in store.group_roles.list_group_roles(&group.rec_id).await? {
            roles.insert(role.qualified_name());
        }
    }

    Ok(roles.into_iter().collect())
}

async fn active_user(store: &Persistence, rec_id: &str) -> ApiResult<User> {
    store
        .users
        .get_user_by_rec_id(rec_id)
        .await?
        .filter(User::is_active)
        .ok_or_else(|| AppError::Unauthorized("Account is not active".to_string()))
}

// ============================================
// Route Handlers
// ============================================

/// POST /api/v1/auth/authenticate
///
/// Authenticate with email and passphrase, receive a token pair.
pub async fn authenticate(
    State(state): State<SharedState>,
    Json(req): Json<AuthenticateRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let invalid = || AppError::Unauthorized("Invalid email or passphrase".to_string());

    let user = state
        .store
        .users
        .get_user_by_email(&req.email)
        .await?
        .ok_or_else(invalid)?;

    if !verify_passphrase(&req.passphrase, &user.pass_phrase)? {
        return Err(invalid());
    }
    if !user.is_active() {
        return Err(AppError::Unauthorized("Account is not active".to_string()));
    }

    let roles = resolve_roles(&state.store, &user).await?;
    let tokens = state.tokens.issue_pair(&user.rec_id, roles)?;

    info!(subject = %user.rec_id, "authenticated");
    Ok(Json(TokenResponse {
        success: true,
        tokens,
    }))
}

/// POST /api/v1/auth/refresh
///
/// Trade a refresh token for a new pair. The presented token is spent: only
/// the first of any concurrent refreshes with it succeeds.
pub async fn refresh(
    State(state): State<SharedState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let claims = state
        .tokens
        .validate_as(&req.refresh_token, TokenType::Refresh)?;

    let user = active_user(&state.store, &claims.sub).await?;
    let roles = resolve_roles(&state.store, &user).await?;

    if !state.store.revocations.revoke(claims.jti, claims.exp).await? {
        return Err(AppError::Unauthorized("Token revoked".to_string()));
    }
    let tokens = state.tokens.issue_pair(&user.rec_id, roles)?;

    Ok(Json(TokenResponse {
        success: true,
        tokens,
    }))
}

/// POST /api/v1/auth/logout
///
/// Revoke the caller's access token and the refresh token handed in.
pub async fn logout(
    State(state): State<SharedState>,
    caller: Claims,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let claims = state
        .tokens
        .validate_as(&req.refresh_token, TokenType::Refresh)?;
    if claims.sub != caller.sub {
        return Err(AppError::BadRequest(
            "Refresh token belongs to another subject".to_string(),
        ));
    }

    // Either may already be spent, logging out twice is not an error
    state.store.revocations.revoke(claims.jti, claims.exp).await?;
    state.store.revocations.revoke(caller.jti, caller.exp).await?;

    info!(subject = %caller.sub, "logged out");
    Ok(Json(MessageResponse {
        success: true,
        message: "Logged out".to_string(),
    }))
}

/// GET /api/v1/auth/whoami
///
/// Identity carried by the verified access token.
pub async fn whoami(claims: Claims) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse {
        success: true,
        subject: claims.sub,
        roles: claims.roles,
        expires_at: claims.exp,
    })
}

/// POST /api/v1/auth/recover
///
/// Mail a recovery token to an active account. The answer is the same whether
/// or not the address is known.
pub async fn recover(
    State(state): State<SharedState>,
    Json(req): Json<RecoverRequest>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let user = state
        .store
        .users
        .get_user_by_email(&req.email)
        .await?
        .filter(User::is_active);

    if let Some(user) = user {
        let token = state
            .tokens
            .issue(&user.rec_id, Vec::new(), TokenType::Recovery)?;
        let mail = Email {
            to: user.email.clone(),
            subject: "Passphrase recovery".to_string(),
            body: format!(
                "<p>Use the following token to reset your passphrase.</p><pre>{}</pre>",
                token
            ),
        };
        // Same answer either way, the caller must not learn the account exists
        match state.mail.enqueue(mail) {
            Ok(()) => info!(subject = %user.rec_id, "recovery mail queued"),
            Err(e) => warn!(subject = %user.rec_id, "recovery mail dropped: {}", e),
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            success: true,
            message: "If the address is registered, a recovery mail is on its way".to_string(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{call, harness, login};
    use axum::http::Method;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_authenticate_issues_pair_with_resolved_roles() {
        let h = harness().await;
        let tokens = login(&h.app).await;

        let claims = h
            .tokens
            .validate_as(tokens["accessToken"].as_str().unwrap(), TokenType::Access)
            .unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.roles, vec!["admin@aaa", "auditor@aaa"]);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_unauthorized() {
        let h = harness().await;
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v1/auth/authenticate",
            None,
            json!({ "email": "jane@aaa.test", "passphrase": "nope" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_whoami_requires_token() {
        let h = harness().await;
        let (status, _) = call(&h.app, Method::GET, "/api/v1/auth/whoami", None, Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let tokens = login(&h.app).await;
        let access = tokens["accessToken"].as_str().unwrap();
        let (status, body) =
            call(&h.app, Method::GET, "/api/v1/auth/whoami", Some(access), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subject"], "u1");
    }

    #[tokio::test]
    async fn test_refresh_token_is_single_use() {
        let h = harness().await;
        let tokens = login(&h.app).await;
        let refresh = json!({ "refreshToken": tokens["refreshToken"] });

        let (status, _) = call(&h.app, Method::POST, "/api/v1/auth/refresh", None, refresh.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&h.app, Method::POST, "/api/v1/auth/refresh", None, refresh).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_spend_the_token_once() {
        let h = harness().await;
        let tokens = login(&h.app).await;
        let refresh = json!({ "refreshToken": tokens["refreshToken"] });

        let (first, second) = tokio::join!(
            call(&h.app, Method::POST, "/api/v1/auth/refresh", None, refresh.clone()),
            call(&h.app, Method::POST, "/api/v1/auth/refresh", None, refresh.clone()),
        );
        let mut statuses = vec![first.0, second.0];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::UNAUTHORIZED]);
    }

    #[tokio::test]
    async fn test_logout_revokes_both_tokens() {
        let h = harness().await;
        let tokens = login(&h.app).await;
        let access = tokens["accessToken"].as_str().unwrap();
        let refresh = json!({ "refreshToken": tokens["refreshToken"] });

        let (status, _) =
            call(&h.app, Method::POST, "/api/v1/auth/logout", Some(access), refresh.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&h.app, Method::POST, "/api/v1/auth/refresh", None, refresh).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            call(&h.app, Method::GET, "/api/v1/auth/whoami", Some(access), Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Token revoked");
    }

    #[tokio::test]
    async fn test_recover_queues_mail_only_for_known_accounts() {
        let h = harness().await;
        for email in ["jane@aaa.test", "nobody@aaa.test"] {
            let (status, _) = call(
                &h.app,
                Method::POST,
                "/api/v1/auth/recover",
                None,
                json!({ "email": email }),
            )
            .await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        h.worker
            .start()
            .stop(tokio::time::Instant::now() + Duration::from_secs(5))
            .await;
        let delivered = h.sender.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].to, "jane@aaa.test");
    }
}
