//! # Nexus Worker Process
//!
//! ```bash
//! DATABASE_URL=postgresql://localhost/nexus \
//! REDIS_URL=redis://localhost:6379/0 \
//! LLM_CONFIG=config/llm_config.json \
//! WORKER_ID=1 \
//!     cargo run --bin nexus-worker
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nexus_orchestration::context::SystemContext;
use nexus_shared::config::NexusConfig;
use nexus_shared::llm::LlmClient;
use nexus_worker::{ResearchWorker, WorkerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    dotenvy::dotenv().ok();

    let config = match NexusConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let worker_config = WorkerConfig {
        worker_id: std::env::var("WORKER_ID")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(std::process::id),
        heartbeat_interval: config.heartbeat_interval(),
        ..Default::default()
    };

    info!(worker_id = worker_config.worker_id, "Starting Nexus worker");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let llm = match LlmClient::from_config_file(&config.llm_config_path) {
        Ok(llm) => Arc::new(llm),
        Err(e) => {
            error!(error = %e, path = %config.llm_config_path, "cannot load LLM configuration");
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

    let worker = match ResearchWorker::new(ctx.clone(), llm, worker_config) {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "failed to build worker");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, finishing in-flight work");
        signal_shutdown.cancel();
    });

    let result = worker.run(shutdown).await;
    ctx.shutdown().await;

    match result {
        Ok(()) => {
            info!("Nexus worker shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "worker exited with error");
            ExitCode::FAILURE
        }
    }
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
