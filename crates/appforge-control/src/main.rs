use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use appforge_agent::{AgentConfig, ProjectManager, TokioCommandRunner};
use appforge_control::{routes, state::AppState};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8787";

fn init_tracing() -> Option<WorkerGuard> {
    // Optional second sink: daily-rolling file under APPFORGE_LOG_DIR.
    let (file_layer, guard) = match std::env::var("APPFORGE_LOG_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "appforge-control.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn listen_addr() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("APPFORGE_LISTEN_ADDR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    raw.parse()
        .with_context(|| format!("invalid APPFORGE_LISTEN_ADDR: {raw}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let addr = listen_addr()?;
    let config = AgentConfig::from_env();
    tracing::info!(
        data_root = %config.data_root.display(),
        templates_dir = %config.templates_dir.display(),
        port_start = config.port_range.start,
        port_end = config.port_range.end,
        runtime = %config.runtime.bin,
        "appforge-control starting"
    );

    tokio::fs::create_dir_all(config.workspaces_dir())
        .await
        .with_context(|| format!("create {}", config.workspaces_dir().display()))?;

    let manager = ProjectManager::open(config, Arc::new(TokioCommandRunner)).await;

    // Boot pass: the registry may be stale after a restart.
    match manager.reconcile_all().await {
        Ok(records) => tracing::info!(projects = records.len(), "boot reconcile complete"),
        Err(e) => tracing::warn!(error = %e, "boot reconcile failed"),
    }
    let _poller = manager.spawn_status_poller();

    let app = routes::router(AppState::new(manager));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "appforge-control listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
