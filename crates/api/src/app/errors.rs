use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use flowbridge_core::BridgeError;

pub fn bridge_error_to_response(err: BridgeError) -> axum::response::Response {
    match err {
        BridgeError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        BridgeError::Transient(msg) => json_error(StatusCode::BAD_GATEWAY, "engine_error", msg),
        BridgeError::ProtocolViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "protocol_violation", msg)
        }
        err @ BridgeError::RetriesExhausted { .. } => {
            json_error(StatusCode::CONFLICT, "retries_exhausted", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
