use axum::{
    Router,
    routing::{get, post},
};

pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/topology", get(system::topology))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:job_key", get(jobs::get_job))
        .route("/jobs/:job_key/complete", post(jobs::complete_job))
        .route("/jobs/:job_key/fail", post(jobs::fail_job))
}
