//! HTTP server initialization and routing

use axum::{routing::get, Router};
use log::{error, info};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::shared::state::AppState;
use crate::social::configure_social_routes;

use super::{health_check, health_check_simple, shutdown_signal};

pub fn build_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check_simple))
        .merge(configure_social_routes())
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_axum_server(app_state: Arc<AppState>) -> std::io::Result<()> {
    let addr = format!("{}:{}", app_state.config.server.host, app_state.config.server.port);
    let app = build_router(app_state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {} - is another instance running?", addr, e);
            return Err(e);
        }
    };
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(std::io::Error::other)
}
