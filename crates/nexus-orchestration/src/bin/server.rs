//! # Nexus API Server
//!
//! Runs the HTTP intake, the live monitoring stream, the queue
//! supervisor, and the periodic stats publisher.
//!
//! ```bash
//! DATABASE_URL=postgresql://localhost/nexus \
//! REDIS_URL=redis://localhost:6379/0 \
//!     cargo run --bin nexus-server
//! ```

use std::process::ExitCode;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nexus_orchestration::context::SystemContext;
use nexus_orchestration::stats::run_stats_publisher;
use nexus_orchestration::web;
use nexus_queue::QueueSupervisor;
use nexus_shared::config::NexusConfig;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    dotenvy::dotenv().ok();

    info!("Starting Nexus API server");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match NexusConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let ctx = match SystemContext::production(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "failed to initialize system context");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();

    // Queue supervisor: reclaims jobs from crashed workers
    let supervisor = QueueSupervisor::new(
        ctx.queue.clone(),
        ctx.event_bus.clone(),
        ctx.config.heartbeat_interval(),
    );
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown.clone()));

    // Periodic queue-depth events for the monitoring stream
    let stats_handle = tokio::spawn(run_stats_publisher(
        ctx.clone(),
        ctx.config.heartbeat_interval(),
        shutdown.clone(),
    ));

    let bind_addr = format!("{}:{}", ctx.config.api_host, ctx.config.api_port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind API listener");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %bind_addr, "API listening");

    let app = web::router(ctx.clone());
    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let mut server_done = false;
    tokio::select! {
        result = &mut server_handle => {
            server_done = true;
            if let Ok(Err(e)) = result {
                error!(error = %e, "server error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        if !server_done {
            let _ = server_handle.await;
        }
        let _ = supervisor_handle.await;
        let _ = stats_handle.await;
    })
    .await;
    ctx.shutdown().await;

    info!("Nexus API server shutdown complete");
    ExitCode::SUCCESS
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
