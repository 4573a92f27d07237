use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use themebox_agent::{AgentConfig, support::format_error_chain};
use themebox_control::{api, state::AppState};
use themebox_migration::{Migrator, MigratorTrait};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Stdout logging, plus a daily-rotated file under `THEMEBOX_LOG_DIR` when set.
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match std::env::var("THEMEBOX_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "themebox-control.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn init_db_and_migrate() -> anyhow::Result<Arc<themebox_db::sea_orm::DatabaseConnection>> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
    let db = themebox_db::connect(&database_url)
        .await
        .context("connect to database")?;

    // Apply migrations on boot (idempotent).
    Migrator::up(&db, None).await.context("apply migrations")?;
    Ok(Arc::new(db))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();
    if let Err(e) = run().await {
        tracing::error!(error = %format_error_chain(&e), "themebox-control failed");
        return Err(e);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cfg = AgentConfig::load().context("load configuration")?;
    let db = init_db_and_migrate().await?;
    let state = AppState::new(&cfg, db);
    let lifecycle = state.lifecycle.clone();

    let addr: SocketAddr = std::env::var("THEMEBOX_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("parse THEMEBOX_BIND")?;
    tracing::info!(
        %addr,
        data_root = %cfg.data_root.display(),
        pool_size = cfg.ports.size,
        tunnels = cfg.tunnel.enabled,
        "themebox-control HTTP listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Sandbox processes stay up; only tunnels are released.
    let closed = lifecycle.shutdown().await;
    tracing::info!(closed, "tunnels closed, exiting");
    Ok(())
}
