//! HTTP server initialization and routing

use axum::routing::get;
use axum::Router;
use log::{error, info};
use std::sync::Arc;

use crate::gateway;
use crate::shared::state::AppState;

use super::health_check;

pub async fn run_axum_server(app_state: Arc<AppState>) -> std::io::Result<()> {
    let host = app_state.config.server.host.clone();
    let port = app_state.config.server.port;

    let app = Router::new()
        .merge(gateway::router())
        .route("/health", get(health_check))
        .with_state(app_state);

    let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "Failed to bind to {}:{}: {} - is another instance running?",
                host, port, e
            );
            return Err(e);
        }
    };
    info!("HTTP server listening on {}:{}", host, port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(std::io::Error::other)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
