//! Request middleware pipeline
//!
//! [`MiddlewareChain`] is composed from the CORS settings and attached to the
//! finished router so that it wraps every request, matched route or not.
//!
//! Stage order, outermost first:
//!
//! 1. CORS header negotiation (CORS enabled only)
//! 2. `OPTIONS` short-circuit (CORS enabled only, reached when
//!    `server.http.cors.optionpassthrough` is set)
//! 3. response compression (CORS enabled only)
//! 4. client address resolution
//! 5. transaction id assignment
//! 6. token verification
//!
//! Token verification must stay innermost: its audit log needs the client
//! address and transaction id already attached to the request.

mod client_ip;
mod cors;

pub use client_ip::{resolve_client, ClientIp};
pub use cors::{negotiate_cors, short_circuit_options, CorsStage};

use crate::auth::{verify_token, TokenVerifier};
use crate::config::CorsSettings;
use crate::error::BootstrapError;
use axum::Router;
use tower_http::compression::predicate::{NotForContentType, Predicate, SizeAbove};
use tower_http::compression::CompressionLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::info;

/// Bodies smaller than this are sent uncompressed
pub const COMPRESSION_MIN_SIZE: u16 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cors,
    CorsShortCircuit,
    Compression,
    ClientIp,
    TransactionId,
    TokenVerification,
}

const CORS_STAGES: [Stage; 3] = [Stage::Cors, Stage::CorsShortCircuit, Stage::Compression];
const MANDATORY_STAGES: [Stage; 3] = [Stage::ClientIp, Stage::TransactionId, Stage::TokenVerification];

/// Ordered middleware stages, ready to wrap a router
#[derive(Debug, Clone)]
pub struct MiddlewareChain {
    stages: Vec<Stage>,
    cors: Option<CorsStage>,
}

impl MiddlewareChain {
    pub fn compose(settings: &CorsSettings) -> Result<Self, BootstrapError> {
        let cors = if settings.enabled {
            Some(CorsStage::new(settings)?)
        } else {
            info!("CORS handling is disabled");
            None
        };

        let stages = cors
            .iter()
            .flat_map(|_| CORS_STAGES)
            .chain(MANDATORY_STAGES)
            .collect();

        Ok(Self { stages, cors })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Wrap `router` with every stage.
    ///
    /// axum puts each added layer around the ones before it, so the stages are
    /// applied innermost first.
    pub fn attach(self, router: Router, verifier: TokenVerifier) -> Router {
        let Self { stages, cors } = self;

        stages.iter().rev().fold(router, |router, stage| match (stage, &cors) {
            (Stage::Cors, Some(cors)) => router.layer(axum::middleware::from_fn_with_state(
                cors.clone(),
                negotiate_cors,
            )),
            (Stage::CorsShortCircuit, Some(cors)) => router.layer(
                axum::middleware::from_fn_with_state(cors.clone(), short_circuit_options),
            ),
            (Stage::Cors | Stage::CorsShortCircuit, None) => router,
            (Stage::Compression, _) => router.layer(
                CompressionLayer::new().compress_when(
                    SizeAbove::new(COMPRESSION_MIN_SIZE)
                        .and(NotForContentType::GRPC)
                        .and(NotForContentType::IMAGES)
                        .and(NotForContentType::SSE),
                ),
            ),
            (Stage::ClientIp, _) => router.layer(axum::middleware::from_fn(resolve_client)),
            (Stage::TransactionId, _) => router
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid)),
            (Stage::TokenVerification, _) => router.layer(
                axum::middleware::from_fn_with_state(verifier.clone(), verify_token),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{TokenFactory, TokenType};
    use crate::backend::{RepoResult, RevocationRepository};
    use crate::config::Settings;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        routing::get,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    #[derive(Default)]
    struct RevokedIds(Mutex<HashSet<Uuid>>);

    #[async_trait]
    impl RevocationRepository for RevokedIds {
        async fn revoke(&self, jti: Uuid, _expires_at: i64) -> RepoResult<bool> {
            Ok(self.0.lock().unwrap().insert(jti))
        }

        async fn is_revoked(&self, jti: Uuid) -> RepoResult<bool> {
            Ok(self.0.lock().unwrap().contains(&jti))
        }
    }

    fn cors_settings(enabled: bool) -> CorsSettings {
        let mut cors = Settings::from_overrides(&[]).unwrap().cors;
        cors.enabled = enabled;
        cors
    }

    fn tokens() -> Arc<TokenFactory> {
        Arc::new(
            TokenFactory::new(
                "test-key",
                "HS256",
                "aaa.test",
                Duration::from_secs(60),
                Duration::from_secs(600),
            )
            .unwrap(),
        )
    }

    fn app_with(
        cors: &CorsSettings,
        tokens: Arc<TokenFactory>,
        revoked: Arc<RevokedIds>,
    ) -> Router {
        let router = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route("/big", get(|| async { "x".repeat(4096) }));
        MiddlewareChain::compose(cors)
            .unwrap()
            .attach(router, TokenVerifier::new(tokens, revoked))
    }

    fn app(enabled: bool, tokens: Arc<TokenFactory>) -> Router {
        app_with(&cors_settings(enabled), tokens, Arc::default())
    }

    fn preflight(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri(uri)
            .header(header::ORIGIN, "https://a.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap()
    }

    fn bearer(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_cors_enabled_chain_has_six_ordered_stages() {
        let chain = MiddlewareChain::compose(&cors_settings(true)).unwrap();
        assert_eq!(
            chain.stages(),
            &[
                Stage::Cors,
                Stage::CorsShortCircuit,
                Stage::Compression,
                Stage::ClientIp,
                Stage::TransactionId,
                Stage::TokenVerification,
            ]
        );
    }

    #[test]
    fn test_cors_disabled_chain_keeps_mandatory_order() {
        let chain = MiddlewareChain::compose(&cors_settings(false)).unwrap();
        assert_eq!(
            chain.stages(),
            &[Stage::ClientIp, Stage::TransactionId, Stage::TokenVerification]
        );
    }

    #[tokio::test]
    async fn test_every_response_carries_a_request_id() {
        let response = app(false, tokens())
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_rejected_token_is_attributed_to_a_transaction() {
        let response = app(false, tokens())
            .oneshot(bearer("/ping", "not-a-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let tokens = tokens();
        let token = tokens.issue("user-1", vec![], TokenType::Access).unwrap();
        let response = app(false, tokens).oneshot(bearer("/ping", &token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_revoked_token_is_rejected() {
        let tokens = tokens();
        let token = tokens.issue("user-1", vec![], TokenType::Access).unwrap();
        let claims = tokens.validate(&token).unwrap();
        let revoked = Arc::new(RevokedIds::default());
        revoked.revoke(claims.jti, claims.exp).await.unwrap();

        let response = app_with(&cors_settings(false), tokens, revoked)
            .oneshot(bearer("/ping", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_passed_through_preflight_is_answered_by_short_circuit() {
        let response = app(true, tokens()).oneshot(preflight("/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://a.com"
        );
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[tokio::test]
    async fn test_options_never_reach_routes() {
        let response = app(true, tokens())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_preflight_without_passthrough_is_answered_by_cors_handler() {
        let mut cors = cors_settings(true);
        cors.options_passthrough = false;
        let response = app_with(&cors, tokens(), Arc::default())
            .oneshot(preflight("/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://a.com"
        );
    }

    #[tokio::test]
    async fn test_regular_requests_get_cors_headers() {
        let response = app(true, tokens())
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header(header::ORIGIN, "https://a.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://a.com"
        );
    }

    #[tokio::test]
    async fn test_compression_respects_minimum_size() {
        let request = |uri: &str| {
            Request::builder()
                .uri(uri)
                .header(header::ACCEPT_ENCODING, "gzip")
                .body(Body::empty())
                .unwrap()
        };

        let small = app(true, tokens()).oneshot(request("/ping")).await.unwrap();
        assert!(small.headers().get(header::CONTENT_ENCODING).is_none());

        let big = app(true, tokens()).oneshot(request("/big")).await.unwrap();
        assert_eq!(big.headers().get(header::CONTENT_ENCODING).unwrap(), "gzip");
    }

    #[tokio::test]
    async fn test_compression_absent_without_cors() {
        let response = app(false, tokens())
            .oneshot(
                Request::builder()
                    .uri("/big")
                    .header(header::ACCEPT_ENCODING, "gzip")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    }
}
