//! Request handlers for the model routes.

use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use modelvault_core::{DownloadRequest, ModelVaultError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Default, Deserialize)]
struct ModelBody {
    #[serde(default)]
    model: Option<String>,
}

/// Extract a non-empty `model` field from a JSON body.
fn requested_model(body: &Bytes) -> Option<String> {
    serde_json::from_slice::<ModelBody>(body)
        .ok()?
        .model
        .filter(|model| !model.trim().is_empty())
}

fn missing_model() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "No model provided"})),
    )
        .into_response()
}

fn error_response(operation: &str, err: &ModelVaultError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        error!("A fatal error occurred during {}: {}", operation, err);
    } else {
        debug!("{} rejected: {}", operation, err);
    }
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `POST /add_model`
pub async fn handle_add_model(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(model) = requested_model(&body) else {
        return missing_model();
    };

    match state.downloader.download(&model).await {
        Ok(DownloadRequest::Accepted { download_id }) => Json(json!({
            "success": true,
            "status": "accepted",
            "download_id": download_id,
        }))
        .into_response(),
        Ok(DownloadRequest::AlreadyInstalled) => {
            Json(json!({"success": true, "status": "installed"})).into_response()
        }
        Err(e) => error_response("download", &e),
    }
}

/// `POST /add_model/cancel`
pub async fn handle_cancel_download(State(state): State<Arc<AppState>>) -> Response {
    match state.downloader.cancel().await {
        Ok(cancelled) => Json(json!({"success": true, "cancelled": cancelled})).into_response(),
        Err(e) => error_response("cancel", &e),
    }
}

/// `GET /add_model/status`
pub async fn handle_download_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.downloader.status().await).into_response()
}

/// `POST /remove_model`
pub async fn handle_remove_model(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(model) = requested_model(&body) else {
        return missing_model();
    };

    match state.downloader.remove(&model).await {
        Ok(removed) => Json(json!({"success": true, "removed": removed})).into_response(),
        Err(e) => error_response("remove", &e),
    }
}

/// `GET /models`
pub async fn handle_list_models(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({"models": state.downloader.models().await})).into_response()
}
