mod config;
mod db;
mod event;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::services::archive::PgArchive;
use crate::services::auth::JwtAuthenticator;
use crate::services::buffer::{BufferStore, PgBuffer};
use crate::state::{AppState, Shutdown};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::from_env().expect("invalid configuration");
    let port = config.port;

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("database init failed");

    let buffer = Arc::new(PgBuffer::new(pool.clone()));
    if config.is_dev() {
        match buffer.clear_all().await {
            Ok(cleared) => tracing::info!(cleared, "dev mode: cleared canvas buffers"),
            Err(e) => tracing::warn!(error = %e, "dev mode: failed to clear canvas buffers"),
        }
    }
    let archive = Arc::new(PgArchive::new(pool));
    let auth = Arc::new(JwtAuthenticator::new(config.jwt_secret.as_bytes()));

    let state = AppState::new(config, buffer, archive, auth);
    let sync = services::sync::spawn_sync_worker(state.clone());

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "canvas relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await
        .expect("server failed");

    if let Err(e) = sync.await {
        tracing::error!(error = %e, "sync worker panicked");
    }
    tracing::info!("canvas relay stopped");
}

/// Resolve on Ctrl-C or SIGTERM and flip the shared shutdown flag.
async fn shutdown_signal(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
        () = shutdown.wait() => {}
    }

    tracing::info!("shutdown signal received");
    shutdown.trigger();
}
