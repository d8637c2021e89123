//! HTTP server implementation using Axum.

use crate::handlers::{
    handle_add_model, handle_cancel_download, handle_download_status, handle_health,
    handle_list_models, handle_remove_model,
};
use axum::{
    routing::{get, post},
    Router,
};
use modelvault_core::ModelDownloader;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    pub downloader: ModelDownloader,
}

/// Build the router with all model routes.
pub fn build_router(downloader: ModelDownloader) -> Router {
    let state = Arc::new(AppState { downloader });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/add_model", post(handle_add_model))
        .route("/add_model/cancel", post(handle_cancel_download))
        .route("/add_model/status", get(handle_download_status))
        .route("/remove_model", post(handle_remove_model))
        .route("/models", get(handle_list_models))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    downloader: ModelDownloader,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = build_router(downloader);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
