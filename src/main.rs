//! aaa-server - authentication and authorization service
//!
//! Startup resolves every setting, composes the request pipeline, selects the
//! persistence and mail backends and builds the token factory before a single
//! socket is opened. A configuration problem ends the process with status 1.
//!
//! Ctrl+C (SIGINT) starts a graceful shutdown: the mail worker flushes, then
//! in-flight requests get until `server.timeout.graceshut` to complete.

mod auth;
mod backend;
mod config;
mod error;
mod mailer;
mod middleware;
mod routes;
mod server;
mod state;

use crate::config::{log_directive, Settings};
use crate::error::BootstrapError;
use crate::server::Application;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            init_tracing("ERROR");
            error!("Configuration error: {}", e);
            return Err(e.into());
        }
    };
    init_tracing(&settings.server.log_level);

    info!("Starting aaa-server {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&settings).await {
        error!("Fatal: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn run(settings: &Settings) -> Result<(), BootstrapError> {
    let runtime = Application::initialize(settings)?.listen().await?;
    info!("Server ready on {}, press Ctrl+C to stop", runtime.local_addr());

    runtime.run_until(interrupt_signal()).await;
    Ok(())
}

/// Initialize tracing at the level named by `server.log.level`; `RUST_LOG` wins when set
fn init_tracing(level: &str) {
    let directive = log_directive(level).unwrap_or_else(|| {
        eprintln!("Unknown log level '{}', logging errors only", level);
        "error"
    });
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Resolve on the first Ctrl+C (SIGINT). Other signals keep their default behavior.
async fn interrupt_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown..."),
        Err(e) => {
            error!("Failed to install Ctrl+C handler, graceful shutdown unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
