//! Guardian Server
//!
//! Runtime protection in front of a multi-tenant service: admission
//! control, payload threat screening, CSRF, per-tenant cost quotas with
//! alerting, security event logging and auto-heal with a degraded mode.

use guardian_core::LoggingConfig;
use guardian_server::config::load_guardian_config;
use guardian_server::shutdown::{shutdown_signal, ShutdownCoordinator};
use guardian_server::tasks::spawn_background_tasks;
use guardian_server::{build_router, AppState};
use std::net::SocketAddr;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_guardian_config()?;
    init_logging(&config.logging);

    info!(
        listen_addr = %config.listen_addr,
        environment = ?config.environment,
        storage = %config.storage.profile,
        "Starting Guardian server"
    );

    let listen_addr = config.listen_addr.clone();
    let shutdown_timeout = config.shutdown.timeout_seconds;

    let state = AppState::from_config(config).await?;
    let coordinator = ShutdownCoordinator::new(shutdown_timeout);
    let tasks = spawn_background_tasks(&state, &coordinator);

    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(%listen_addr, "Guardian server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(coordinator.clone()))
    .await?;

    // The server may stop for reasons other than the token.
    coordinator.trigger();
    if !coordinator.wait_for_tasks().await {
        let report = state.flush_all().await;
        warn!(
            written = report.written,
            failed = report.failed,
            "background tasks timed out, flushed buffers directly"
        );
    }
    for task in tasks {
        task.abort();
    }

    info!("Guardian server stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}
