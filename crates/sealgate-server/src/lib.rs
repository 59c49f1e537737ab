//! Sealgate service process: HTTP surface, sweeper worker, lifecycle.

pub mod cli;
pub mod http;
pub mod logging;

use anyhow::Context;
use sealgate_core::{ExecutorDispatcher, ServiceConfig, ServiceContext};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Serve the HTTP API until a shutdown signal arrives.
pub async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let ctx = ServiceContext::init(config.clone(), ExecutorDispatcher)
        .with_context(|| format!("failed to open store {}", config.store_location()))?;

    let (stop, stopped) = watch::channel(false);
    let sweeper = config
        .background_worker
        .then(|| ctx.sweeper().spawn(stopped));

    let app = http::router(ctx.service(), &config);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(
        event = "server.listening",
        addr = %listener.local_addr()?,
        sign_server = config.sign_server,
        background_worker = config.background_worker,
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = stop.send(true);
    if let Some(handle) = sweeper {
        if let Err(e) = handle.await {
            tracing::warn!(event = "sweep.join_failed", error = %e);
        }
    }
    ctx.shutdown()?;
    Ok(())
}

/// Run only the sweeper until a shutdown signal arrives.
pub async fn worker(config: ServiceConfig) -> anyhow::Result<()> {
    let ctx = ServiceContext::init(config.clone(), ExecutorDispatcher)
        .with_context(|| format!("failed to open store {}", config.store_location()))?;

    let (stop, stopped) = watch::channel(false);
    let handle = ctx.sweeper().spawn(stopped);

    shutdown_signal().await;
    let _ = stop.send(true);
    if let Err(e) = handle.await {
        tracing::warn!(event = "sweep.join_failed", error = %e);
    }
    ctx.shutdown()?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(event = "signal.ctrl_c_failed", error = %e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(event = "signal.sigterm_failed", error = %e);
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
    tracing::info!(event = "shutdown.requested");
}
