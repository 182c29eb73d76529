//! Authentication middleware
//!
//! Verifies `Authorization: Bearer` tokens. Runs after the client-address and
//! transaction-id stages so a rejected token can be attributed in the audit log.

use crate::auth::{Claims, TokenFactory, TokenType};
use crate::backend::RevocationRepository;
use crate::error::AppError;
use crate::middleware::ClientIp;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tower_http::request_id::RequestId;
use tracing::{debug, warn};

/// State of the token verification stage
#[derive(Clone)]
pub struct TokenVerifier {
    tokens: Arc<TokenFactory>,
    revocations: Arc<dyn RevocationRepository>,
}

impl TokenVerifier {
    pub fn new(tokens: Arc<TokenFactory>, revocations: Arc<dyn RevocationRepository>) -> Self {
        Self {
            tokens,
            revocations,
        }
    }

    /// Signature, issuer, expiry and type first, then the revocation list
    async fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let claims = self.tokens.validate_as(token, TokenType::Access)?;
        if self.revocations.is_revoked(claims.jti).await? {
            return Err(AppError::Unauthorized("Token revoked".to_string()));
        }
        Ok(claims)
    }
}

/// Validate the bearer token, if any, and attach its claims to the request.
///
/// Requests without an `Authorization` header pass through anonymously; handlers
/// that need an identity extract [`Claims`] and get a 401 when it is absent.
pub async fn verify_token(
    State(verifier): State<TokenVerifier>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !request.headers().contains_key(AUTHORIZATION) {
        return Ok(next.run(request).await);
    }

    let transaction_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or("-")
        .to_string();
    let client_ip = request
        .extensions()
        .get::<ClientIp>()
        .copied()
        .unwrap_or_default();

    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    let verified = match bearer {
        Some(token) => verifier.verify(&token).await,
        None => Err(AppError::Unauthorized("Invalid authorization format".to_string())),
    };

    match verified {
        Ok(claims) => {
            debug!(
                transaction_id = %transaction_id,
                client_ip = %client_ip,
                subject = %claims.sub,
                "token verified"
            );
            // Insert claims into request extensions for handlers to use
            request.extensions_mut().insert(claims);
            Ok(next.run(request).await)
        }
        Err(e) => {
            warn!(
                transaction_id = %transaction_id,
                client_ip = %client_ip,
                path = %request.uri().path(),
                "token verification failed: {}",
                e
            );
            Err(e)
        }
    }
}

impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))
    }
}
