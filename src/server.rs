//! Service lifecycle
//!
//! [`Application`] owns startup: it resolves timeouts, composes the middleware
//! chain, selects backends, builds the token factory and registers routes.
//! Any failure there is returned before a socket is opened.
//!
//! [`Application::listen`] binds the listener, starts serving on its own task
//! and launches the mail worker. The resulting [`ServerRuntime`] drains on
//! interrupt: mail worker first, then the listener, both bounded by one
//! graceful-shutdown deadline.

use crate::auth::{TokenFactory, TokenVerifier};
use crate::backend::BackendBinding;
use crate::config::{describe_duration, parse_duration, Settings, TimeoutSettings};
use crate::error::BootstrapError;
use crate::mailer::{self, MailWorker, MailWorkerHandle};
use crate::middleware::MiddlewareChain;
use crate::routes::{api_routes, log_routes, RouteTable};
use crate::state::{AppState, SharedState};
use axum::{http::StatusCode, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Created,
    Initializing,
    Listening,
    Draining,
    Stopped,
}

/// Server timeouts. A zero write, read or idle timeout means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimeouts {
    pub graceful_shutdown: Duration,
    pub write: Duration,
    pub read: Duration,
    pub idle: Duration,
}

impl ServerTimeouts {
    pub fn resolve(settings: &TimeoutSettings) -> Result<Self, BootstrapError> {
        Ok(Self {
            graceful_shutdown: parse_duration(
                "server.timeout.graceshut",
                &settings.graceful_shutdown,
            )?,
            write: parse_duration("server.timeout.write", &settings.write)?,
            read: parse_duration("server.timeout.read", &settings.read)?,
            idle: parse_duration("server.timeout.idle", &settings.idle)?,
        })
    }

    /// Operator notice for configured timeouts this server cannot enforce
    pub fn unenforced_notice(&self) -> Option<String> {
        (!self.idle.is_zero()).then(|| {
            format!(
                "server.timeout.idle={} is not enforced, idle keep-alive connections stay open until the client closes them",
                describe_duration(self.idle)
            )
        })
    }
}

/// A fully initialized server that has not opened its listener yet
pub struct Application {
    address: String,
    timeouts: ServerTimeouts,
    chain: MiddlewareChain,
    state: SharedState,
    routes: RouteTable<SharedState>,
    worker: MailWorker,
    lifecycle: watch::Sender<LifecycleState>,
    started: Instant,
}

impl Application {
    /// Initialize with the backends named by `db.type` and `mailer.type`
    pub fn initialize(settings: &Settings) -> Result<Self, BootstrapError> {
        Self::build(settings, BackendBinding::select)
    }

    /// Initialize with backends chosen by the caller
    pub fn initialize_with(
        settings: &Settings,
        backends: BackendBinding,
    ) -> Result<Self, BootstrapError> {
        Self::build(settings, move |_| Ok(backends))
    }

    fn build<F>(settings: &Settings, select_backends: F) -> Result<Self, BootstrapError>
    where
        F: FnOnce(&Settings) -> Result<BackendBinding, BootstrapError>,
    {
        let started = Instant::now();
        let (lifecycle, _) = watch::channel(LifecycleState::Created);
        lifecycle.send_replace(LifecycleState::Initializing);
        info!("Initializing server");

        let timeouts = ServerTimeouts::resolve(&settings.server.timeouts)?;
        let chain = MiddlewareChain::compose(&settings.cors)?;
        let backends = select_backends(settings)?;
        let tokens = Arc::new(TokenFactory::from_settings(&settings.token)?);

        let (mail, worker) = mailer::channel(backends.email_sender, settings.mailer.queue_capacity);
        let state = Arc::new(AppState::new(backends.persistence, tokens, mail));

        Ok(Self {
            address: settings.server.address(),
            timeouts,
            chain,
            state,
            routes: api_routes(),
            worker,
            lifecycle,
            started,
        })
    }

    /// Register an additional route before the server starts listening
    #[cfg(test)]
    pub fn route<H, T>(mut self, path: &str, method: axum::http::Method, handler: H) -> Self
    where
        H: axum::handler::Handler<T, SharedState>,
        T: 'static,
    {
        self.routes = self.routes.route(path, method, handler);
        self
    }

    #[cfg(test)]
    pub fn timeouts(&self) -> ServerTimeouts {
        self.timeouts
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Bind the listener, start serving and launch the mail worker
    pub async fn listen(self) -> Result<ServerRuntime, BootstrapError> {
        let (router, entries) = self.routes.into_parts();
        let verifier = TokenVerifier::new(
            self.state.tokens.clone(),
            self.state.store.revocations.clone(),
        );
        let router = self
            .chain
            .attach(router.with_state(self.state.clone()), verifier);
        let router = apply_timeouts(router, &self.timeouts).layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

        log_routes(&entries);

        let bind_error = |source| BootstrapError::Bind {
            address: self.address.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let timeouts = self.timeouts;
        info!("Listening on http://{}", local_addr);
        info!(
            "Timeouts: graceful shutdown {}, write {}, read {}, idle {}",
            describe_duration(timeouts.graceful_shutdown),
            describe_duration(timeouts.write),
            describe_duration(timeouts.read),
            describe_duration(timeouts.idle)
        );
        if let Some(notice) = timeouts.unenforced_notice() {
            warn!("{}", notice);
        }

        let (drain_tx, drain_rx) = oneshot::channel::<()>();
        let serve = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            let result = axum::serve(listener, service)
                .with_graceful_shutdown(async move {
                    let _ = drain_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        });

        let mail_worker = self.worker.start();
        self.lifecycle.send_replace(LifecycleState::Listening);

        Ok(ServerRuntime {
            local_addr,
            timeouts,
            serve,
            drain: drain_tx,
            mail_worker,
            lifecycle: self.lifecycle,
            started: self.started,
        })
    }
}

fn apply_timeouts(router: Router, timeouts: &ServerTimeouts) -> Router {
    let router = if timeouts.write.is_zero() {
        router
    } else {
        router.layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeouts.write,
        ))
    };
    if timeouts.read.is_zero() {
        router
    } else {
        router.layer(RequestBodyTimeoutLayer::new(timeouts.read))
    }
}

/// A listening server
pub struct ServerRuntime {
    local_addr: SocketAddr,
    timeouts: ServerTimeouts,
    serve: JoinHandle<()>,
    drain: oneshot::Sender<()>,
    mail_worker: MailWorkerHandle,
    lifecycle: watch::Sender<LifecycleState>,
    started: Instant,
}

impl ServerRuntime {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Serve until `interrupt` resolves, then drain. Returns the uptime.
    pub async fn run_until<F>(mut self, interrupt: F) -> Duration
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = interrupt => info!("Interrupt received, shutting down"),
            _ = &mut self.serve => warn!("Server task ended before any interrupt"),
        }
        self.drain().await
    }

    /// Stop the mail worker, then the listener, within one grace period
    pub async fn drain(mut self) -> Duration {
        self.lifecycle.send_replace(LifecycleState::Draining);
        let grace = self.timeouts.graceful_shutdown;
        let deadline = Instant::now() + grace;

        info!("Stopping mail worker");
        self.mail_worker.stop(deadline).await;

        info!("Draining HTTP listener, grace period {}", describe_duration(grace));
        let _ = self.drain.send(());
        if !self.serve.is_finished() {
            match tokio::time::timeout_at(deadline, &mut self.serve).await {
                Ok(Ok(())) => info!("HTTP listener drained"),
                Ok(Err(e)) => error!("Server task failed: {}", e),
                Err(_) => {
                    warn!("Grace period elapsed with requests in flight, abandoning them");
                    self.serve.abort();
                }
            }
        }

        let uptime = self.started.elapsed();
        info!(
            "Shutting down. This server has been protecting the world for {}",
            describe_duration(uptime)
        );
        self.lifecycle.send_replace(LifecycleState::Stopped);
        uptime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::{Email, EmailSender, MailError};
    use async_trait::async_trait;
    use axum::http::Method;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::Notify;

    fn settings(extra: &[(&str, &str)]) -> Settings {
        let mut overrides = vec![
            ("server.host", "127.0.0.1"),
            ("server.port", "0"),
            ("db.sqlite.path", ":memory:"),
        ];
        overrides.extend_from_slice(extra);
        Settings::from_overrides(&overrides).unwrap()
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    /// Waits for the drain to begin, then checks `/health` while delivering
    struct HealthCheckingSender {
        target: Mutex<Option<(SocketAddr, watch::Receiver<LifecycleState>)>>,
        observed: Mutex<Vec<(LifecycleState, String)>>,
    }

    #[async_trait]
    impl EmailSender for HealthCheckingSender {
        fn name(&self) -> &'static str {
            "HEALTH_CHECKING"
        }

        async fn send(&self, _email: &Email) -> Result<(), MailError> {
            let target = self.target.lock().unwrap().clone();
            if let Some((addr, mut lifecycle)) = target {
                let draining = lifecycle
                    .wait_for(|state| *state == LifecycleState::Draining)
                    .await
                    .map(|_| LifecycleState::Draining)
                    .unwrap_or(LifecycleState::Stopped);
                let response = get(addr, "/health").await;
                let status = response.lines().next().unwrap_or_default().to_string();
                self.observed.lock().unwrap().push((draining, status));
            }
            Ok(())
        }
    }

    #[test]
    fn test_timeouts_resolve() {
        let timeouts = ServerTimeouts::resolve(&settings(&[]).server.timeouts).unwrap();
        assert_eq!(timeouts.graceful_shutdown, Duration::from_secs(15));
        assert_eq!(timeouts.idle, Duration::from_secs(60));
    }

    #[test]
    fn test_unenforced_idle_timeout_is_announced() {
        let timeouts = ServerTimeouts::resolve(&settings(&[]).server.timeouts).unwrap();
        let notice = timeouts.unenforced_notice().unwrap();
        assert!(notice.contains("server.timeout.idle=1m"));

        let timeouts =
            ServerTimeouts::resolve(&settings(&[("server.timeout.idle", "0s")]).server.timeouts)
                .unwrap();
        assert_eq!(timeouts.unenforced_notice(), None);
    }

    #[tokio::test]
    async fn test_malformed_timeout_aborts_initialization() {
        let err = Application::initialize(&settings(&[("server.timeout.write", "soon")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("AAA_SERVER_TIMEOUT_WRITE"));
    }

    #[tokio::test]
    async fn test_unknown_backends_abort_initialization() {
        let err = Application::initialize(&settings(&[("db.type", "UNKNOWN")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown database type UNKNOWN"));

        let err = Application::initialize(&settings(&[("mailer.type", "FAX")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown mailer type FAX"));
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let app = Application::initialize(&settings(&[])).unwrap();
        assert_eq!(app.timeouts().graceful_shutdown, Duration::from_secs(15));
        let lifecycle = app.subscribe();
        assert_eq!(*lifecycle.borrow(), LifecycleState::Initializing);

        let runtime = app.listen().await.unwrap();
        assert_eq!(*lifecycle.borrow(), LifecycleState::Listening);

        let health = get(runtime.local_addr(), "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.to_lowercase().contains("x-request-id"));

        runtime.run_until(async {}).await;
        assert_eq!(*lifecycle.borrow(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_mail_worker_stops_before_listener() {
        let sender = Arc::new(HealthCheckingSender {
            target: Mutex::new(None),
            observed: Mutex::new(Vec::new()),
        });
        let settings = settings(&[]);
        let backends = BackendBinding {
            persistence: BackendBinding::select(&settings).unwrap().persistence,
            email_sender: sender.clone(),
        };

        let app = Application::initialize_with(&settings, backends).unwrap();
        let mail = app.state.mail.clone();
        let runtime = app.listen().await.unwrap();
        *sender.target.lock().unwrap() = Some((runtime.local_addr(), runtime.subscribe()));

        // Delivery blocks until the drain starts, then checks the listener
        mail.enqueue(Email {
            to: "jane@aaa.test".to_string(),
            subject: "queued before interrupt".to_string(),
            body: String::new(),
        })
        .unwrap();
        runtime.run_until(async {}).await;

        let observed = sender.observed.lock().unwrap();
        assert_eq!(
            *observed,
            vec![(LifecycleState::Draining, "HTTP/1.1 200 OK".to_string())]
        );
    }

    #[tokio::test]
    async fn test_stuck_handler_does_not_outlive_grace_period() {
        let entered = Arc::new(Notify::new());
        let signal = entered.clone();
        let app = Application::initialize(&settings(&[
            ("server.timeout.graceshut", "300ms"),
            ("server.timeout.write", "0s"),
        ]))
        .unwrap()
        .route("/stall", Method::GET, move || {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                tokio::time::sleep(Duration::from_secs(60)).await;
                "too late"
            }
        });
        let runtime = app.listen().await.unwrap();

        let addr = runtime.local_addr();
        let client = tokio::spawn(async move { get(addr, "/stall").await });
        entered.notified().await;

        let started = Instant::now();
        runtime.run_until(async {}).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(250), "drained too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "drain overran: {:?}", elapsed);
        client.abort();
    }
}
