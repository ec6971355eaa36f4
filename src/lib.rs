pub mod adapters;
pub mod api;
pub mod cancellation;
pub mod config;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod models;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod token;
pub mod uploader;

#[cfg(test)]
mod test_support;

use crate::config::ServiceConfig;
use crate::service::CloudMigrationService;
use anyhow::Context;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Serves the `/cloudmigration` HTTP surface on the configured address until ctrl-c.
pub fn run() -> anyhow::Result<()> {
    let data_dir = ServiceConfig::data_dir_from_env();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let config = ServiceConfig::load(&data_dir).context("failed to load configuration")?;

    if let Err(error) = init_tracing(&config.logs_dir(), &config.log_filter) {
        eprintln!("failed to initialize tracing: {error}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let addr = config.listen_addr.clone();
        let service = CloudMigrationService::from_config(config).context("failed to initialize service")?;
        service.start().await.context("failed to start service")?;

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(addr = %addr, "serving cloud migration api");
        axum::serve(listener, api::router(service))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("api server failed")
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown requested"),
        Err(error) => {
            tracing::warn!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

fn init_tracing(log_dir: &Path, default_filter: &str) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "migration.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
