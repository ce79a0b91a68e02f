use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn topology(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.engine.topology().await {
        Ok(topology) => (StatusCode::OK, Json(topology)).into_response(),
        Err(e) => errors::json_error(StatusCode::BAD_GATEWAY, "engine_unavailable", e.to_string()),
    }
}
