//! REST API module using Axum
//!
//! - loans: CRUD, search, statistics, features, prediction (stored and ad-hoc)
//! - analytics snapshots and read-only document-store views
//! - on-demand reconciliation and model management
//!
//! All responses use the `{data, meta}` / `{error, meta}` envelope.

pub mod envelope;
pub mod error;
pub mod handlers;
mod routes;

pub use error::{ApiError, ApiResult};
pub use handlers::ApiState;

use axum::http::{header, Method};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Environment variable with a comma-separated list of allowed CORS origins.
pub const CORS_ORIGINS_ENV_VAR: &str = "LOAN_PIPELINE_CORS_ORIGINS";

/// Build a CORS layer that is restrictive by default (same-origin only).
fn build_cors_layer() -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
    match std::env::var(CORS_ORIGINS_ENV_VAR) {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods(methods)
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        }
        Err(_) => CorsLayer::new()
            .allow_methods(methods)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    }
}

/// Create the complete application router.
pub fn create_app(state: ApiState, max_payload_bytes: usize) -> Router {
    routes::api_routes(state)
        .layer(RequestBodyLimitLayer::new(max_payload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer())
}
