//! CORS stages
//!
//! Builds the `tower-http` CORS handler from `server.http.cors.*` settings and
//! the short-circuit stage that answers `OPTIONS` before any route is reached.
//!
//! With `server.http.cors.optionpassthrough` the CORS handler only decorates
//! regular requests and hands `OPTIONS` on; the short-circuit stage then
//! answers them with the pre-flight headers and `204 No Content`. Without it
//! the CORS handler answers pre-flights itself.

use crate::config::CorsSettings;
use crate::error::BootstrapError;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};
use tracing::{info, warn};

const WILDCARD: &str = "*";

/// Non-empty entries of a list setting; empty ones are reported and skipped
fn entries<'a>(key: &str, values: &'a [String]) -> Vec<&'a str> {
    let kept: Vec<&str> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    if kept.len() != values.len() {
        warn!("    {} contains empty entries, ignoring them", key);
    }
    kept
}

fn invalid(key: &str, value: &str) -> BootstrapError {
    BootstrapError::Cors(format!("'{}' is not a valid entry for {}", value, key))
}

/// Log every CORS field, one line each
fn log_settings(settings: &CorsSettings) {
    info!("CORS handling is enabled");
    info!("    AllowedOrigins     : {}", settings.allowed_origins.join(","));
    info!("    AllowedHeaders     : {}", settings.allowed_headers.join(","));
    info!("    AllowedMethods     : {}", settings.allowed_methods.join(","));
    info!("    ExposedHeaders     : {}", settings.exposed_headers.join(","));
    info!("    AllowCredentials   : {}", settings.allow_credentials);
    info!("    OptionsPassthrough : {}", settings.options_passthrough);
    info!("    MaxAge             : {}", settings.max_age);
}

/// Build the CORS handler stage.
///
/// A wildcard combined with `allow_credentials` is turned into mirroring of the
/// request, since browsers reject a literal `*` on credentialed requests.
fn cors_layer(settings: &CorsSettings) -> Result<CorsLayer, BootstrapError> {
    log_settings(settings);
    let credentials = settings.allow_credentials;

    let origins = entries("server.http.cors.allow.origins", &settings.allowed_origins);
    if origins.is_empty() {
        return Err(BootstrapError::Cors(
            "server.http.cors.allow.origins resolved to no entries".to_string(),
        ));
    }
    let allow_origin = if origins.contains(&WILDCARD) {
        if credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::any()
        }
    } else {
        let values = origins
            .iter()
            .map(|o| HeaderValue::from_str(o).map_err(|_| invalid("allowed origins", o)))
            .collect::<Result<Vec<_>, _>>()?;
        AllowOrigin::list(values)
    };

    let headers = entries("server.http.cors.allow.headers", &settings.allowed_headers);
    let allow_headers = if headers.contains(&WILDCARD) {
        if credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::any()
        }
    } else {
        let names = headers
            .iter()
            .map(|h| HeaderName::from_bytes(h.as_bytes()).map_err(|_| invalid("allowed headers", h)))
            .collect::<Result<Vec<_>, _>>()?;
        AllowHeaders::list(names)
    };

    let methods = entries("server.http.cors.allow.method", &settings.allowed_methods);
    let allow_methods = if methods.contains(&WILDCARD) {
        if credentials {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::any()
        }
    } else {
        let parsed = methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .map_err(|_| invalid("allowed methods", m))
            })
            .collect::<Result<Vec<_>, _>>()?;
        AllowMethods::list(parsed)
    };

    let exposed = entries("server.http.cors.exposed.headers", &settings.exposed_headers);
    let expose_headers = if exposed.contains(&WILDCARD) {
        if credentials {
            warn!("    ExposedHeaders wildcard is ignored when credentials are allowed");
            ExposeHeaders::list(Vec::<HeaderName>::new())
        } else {
            ExposeHeaders::any()
        }
    } else {
        let names = exposed
            .iter()
            .map(|h| HeaderName::from_bytes(h.as_bytes()).map_err(|_| invalid("exposed headers", h)))
            .collect::<Result<Vec<_>, _>>()?;
        ExposeHeaders::list(names)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_headers(allow_headers)
        .allow_methods(allow_methods)
        .expose_headers(expose_headers)
        .allow_credentials(credentials)
        .max_age(Duration::from_secs(settings.max_age)))
}

/// Shared state of the two CORS stages
#[derive(Debug, Clone)]
pub struct CorsStage {
    layer: CorsLayer,
    options_passthrough: bool,
}

impl CorsStage {
    pub fn new(settings: &CorsSettings) -> Result<Self, BootstrapError> {
        let layer = cors_layer(settings)?;
        // tower-http checks rule combinations when wrapping; do it at startup
        let _ = layer.layer(());
        Ok(Self {
            layer,
            options_passthrough: settings.options_passthrough,
        })
    }

    async fn apply<S>(&self, inner: S, request: Request) -> Response
    where
        S: tower::Service<Request, Response = Response, Error = Infallible> + Send,
        S::Future: Send,
    {
        match self.layer.layer(inner).oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// CORS header negotiation. `OPTIONS` is handed on when passthrough is on.
pub async fn negotiate_cors(
    State(stage): State<CorsStage>,
    request: Request,
    next: Next,
) -> Response {
    if stage.options_passthrough && request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    stage.apply(next, request).await
}

/// Answer every `OPTIONS` request that reaches this stage with `204 No Content`
/// and the pre-flight headers. Route handlers never see `OPTIONS`.
pub async fn short_circuit_options(
    State(stage): State<CorsStage>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::OPTIONS {
        return next.run(request).await;
    }

    let empty = service_fn(|_: Request| async { Ok::<_, Infallible>(Response::new(Body::empty())) });
    let mut response = stage.apply(empty, request).await;
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::split_list;

    fn settings(origins: &str, credentials: bool) -> CorsSettings {
        CorsSettings {
            enabled: true,
            allowed_origins: split_list(origins),
            allowed_headers: split_list("Accept,Authorization,Content-Type"),
            allowed_methods: split_list("GET,POST,OPTIONS"),
            exposed_headers: split_list("*"),
            allow_credentials: credentials,
            options_passthrough: true,
            max_age: 300,
        }
    }

    #[test]
    fn test_listed_origins() {
        assert!(cors_layer(&settings("a.com,b.com", false)).is_ok());
    }

    #[test]
    fn test_wildcards_with_credentials_do_not_conflict() {
        let mut s = settings("*", true);
        s.allowed_headers = split_list("*");
        s.allowed_methods = split_list("*");
        assert!(cors_layer(&s).is_ok());
    }

    #[test]
    fn test_empty_origins_are_a_configuration_error() {
        let err = cors_layer(&settings("", false)).unwrap_err();
        assert!(err.to_string().contains("server.http.cors.allow.origins"));
    }

    #[test]
    fn test_invalid_method_is_rejected() {
        let mut s = settings("a.com", false);
        s.allowed_methods = split_list("GET,NOT A METHOD");
        assert!(cors_layer(&s).is_err());
    }
}
