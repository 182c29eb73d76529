//! Route definitions and route diagnostics
//!
//! axum routers cannot be inspected once built, so routes are registered
//! through a [`RouteTable`] that records each path and its methods alongside
//! the router. The record is what [`log_routes`] prints at startup.

mod auth;
mod directory;

use crate::state::SharedState;
use axum::{
    handler::Handler,
    http::Method,
    routing::{on, MethodFilter},
    Json, Router,
};
use tracing::{error, info};

/// A registered path template and the methods it answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub path: String,
    pub methods: Vec<Method>,
}

/// A router plus the record of what was registered on it
pub struct RouteTable<S = SharedState> {
    router: Router<S>,
    entries: Vec<RouteEntry>,
}

impl<S> Default for RouteTable<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            router: Router::new(),
            entries: Vec::new(),
        }
    }
}

impl<S> RouteTable<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` on `path`.
    ///
    /// A path that is not a template (does not start with `/`) or a method axum
    /// cannot route is recorded without being registered, so diagnostics can
    /// report it.
    pub fn route<H, T>(mut self, path: &str, method: Method, handler: H) -> Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        let filter = match MethodFilter::try_from(method.clone()) {
            Ok(filter) if path.starts_with('/') => filter,
            _ => {
                self.entries.push(RouteEntry {
                    path: path.to_string(),
                    methods: Vec::new(),
                });
                return self;
            }
        };
        self.router = self.router.route(path, on(filter, handler));

        match self
            .entries
            .iter_mut()
            .find(|entry| entry.path == path && !entry.methods.is_empty())
        {
            Some(entry) => entry.methods.push(method),
            None => self.entries.push(RouteEntry {
                path: path.to_string(),
                methods: vec![method],
            }),
        }
        self
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn into_parts(self) -> (Router<S>, Vec<RouteEntry>) {
        (self.router, self.entries)
    }
}

/// Log every route as `Route : <path> [<methods>]`.
///
/// Entries without a path template or without methods are logged as errors
/// and skipped. Returns how many routes were listed.
pub fn log_routes(entries: &[RouteEntry]) -> usize {
    let mut listed = 0;
    for entry in entries {
        if entry.path.is_empty() || !entry.path.starts_with('/') {
            error!("Route has no resolvable path template: '{}'", entry.path);
            continue;
        }
        if entry.methods.is_empty() {
            error!("Route {} has no resolvable methods", entry.path);
            continue;
        }

        let methods = entry
            .methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(",");
        info!("Route : {} [{}]", entry.path, methods);
        listed += 1;
    }
    listed
}

/// All API routes served by the application
pub fn api_routes() -> RouteTable<SharedState> {
    RouteTable::new()
        // Health check
        .route("/health", Method::GET, health_check)
        // Authentication routes
        .route("/api/v1/auth/authenticate", Method::POST, auth::authenticate)
        .route("/api/v1/auth/refresh", Method::POST, auth::refresh)
        .route("/api/v1/auth/logout", Method::POST, auth::logout)
        .route("/api/v1/auth/whoami", Method::GET, auth::whoami)
        .route("/api/v1/auth/recover", Method::POST, auth::recover)
        // Directory routes
        .route("/api/v1/groups/{rec_id}", Method::GET, directory::get_group)
        .route("/api/v1/roles/{rec_id}", Method::GET, directory::get_role)
        .route("/api/v1/tenants/{domain}", Method::GET, directory::get_tenant)
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
