//! HTTP application wiring.
//!
//! - `services.rs`: engine/broker selection and background loops
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request bodies and query strings
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the HTTP router over already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    routes::router()
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}
