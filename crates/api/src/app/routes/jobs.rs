use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use flowbridge_core::{JobKey, ProcessInstanceKey};
use flowbridge_infra::jobs::JobTrackingStore;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::JobsQuery>,
) -> axum::response::Response {
    let mut items = match (query.process_instance_key, query.job_type.as_deref()) {
        (Some(pi), _) => services.store.by_process_instance(ProcessInstanceKey::new(pi)),
        (None, Some(job_type)) => services.store.by_type(job_type),
        (None, None) => services.store.all(),
    };
    if let (Some(_), Some(job_type)) = (query.process_instance_key, query.job_type.as_deref()) {
        items.retain(|j| j.job_type == job_type);
    }

    (StatusCode::OK, Json(json!({ "items": items }))).into_response()
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_key): Path<String>,
) -> axum::response::Response {
    let job_key = match parse_job_key(&job_key) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    match services.store.get(job_key) {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_key} is not tracked")),
    }
}

pub async fn complete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_key): Path<String>,
    Json(body): Json<dto::CompleteJobRequest>,
) -> axum::response::Response {
    let job_key = match parse_job_key(&job_key) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    match services.client.complete(job_key, body.variables).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "jobKey": job_key, "status": "completed" }))).into_response(),
        Err(e) => errors::bridge_error_to_response(e),
    }
}

pub async fn fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_key): Path<String>,
    Query(query): Query<dto::FailJobQuery>,
) -> axum::response::Response {
    let job_key = match parse_job_key(&job_key) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    let retries = query.retries.unwrap_or_else(|| {
        services
            .store
            .get(job_key)
            .map(|j| j.retries.saturating_sub(1))
            .unwrap_or(0)
    });
    let message = query.error_message.unwrap_or_else(|| "failed via HTTP".to_string());

    match services.client.fail(job_key, retries, &message).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "jobKey": job_key, "status": "failed", "retries": retries })),
        )
            .into_response(),
        Err(e) => errors::bridge_error_to_response(e),
    }
}

fn parse_job_key(raw: &str) -> Result<JobKey, axum::response::Response> {
    raw.parse::<JobKey>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_key", e.to_string()))
}
