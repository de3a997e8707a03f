use std::sync::Arc;

use anyhow::Context;
use progd_control::{
    config::{Config, DEFAULT_LOG_FILTER},
    state::AppState,
};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested; managed programs keep running");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = Config::from_env()?;
    config.ensure_directories().await?;
    tracing::info!(
        data_file = %config.data_file.display(),
        log_dir = %config.log_dir.display(),
        "data directories ready"
    );

    let supervisor = Arc::new(config.build_supervisor());

    // One pass so the first reads after a restart already match the OS.
    match supervisor.reconcile_all().await {
        Ok(programs) => {
            let running = programs.iter().filter(|p| p.is_running()).count();
            tracing::info!(programs = programs.len(), running, "startup reconcile done");
        }
        Err(err) => tracing::error!(%err, "startup reconcile failed"),
    }

    let app = progd_control::router(AppState::new(supervisor));

    let addr = config.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "progd HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
