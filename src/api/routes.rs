//! API route table.

use axum::routing::{get, post};
use axum::Router;

use super::handlers::{self, ApiState};

/// Build the API router.
///
/// Collection routes accept both the bare and the trailing-slash form.
/// Static segments such as `/loans/search` and `/analytics/snapshots/latest`
/// take precedence over the `:id` captures next to them.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        // Loans
        .route("/loans", get(handlers::list_loans).post(handlers::create_loan))
        .route("/loans/", get(handlers::list_loans).post(handlers::create_loan))
        .route("/loans/predict", post(handlers::predict_payload))
        .route("/loans/predict/", post(handlers::predict_payload))
        .route("/loans/search", get(handlers::search_loans))
        .route("/loans/search/", get(handlers::search_loans))
        .route("/loans/statistics/overview", get(handlers::statistics_overview))
        .route(
            "/loans/:loan_id",
            get(handlers::get_loan)
                .put(handlers::update_loan)
                .delete(handlers::delete_loan),
        )
        .route("/loans/:loan_id/features", get(handlers::get_features))
        .route("/loans/:loan_id/predictions", get(handlers::list_predictions))
        .route("/loans/:loan_id/predict", post(handlers::predict_stored))
        // Features and predictions by id
        .route("/features", get(handlers::list_features))
        .route("/features/", get(handlers::list_features))
        .route(
            "/predictions/:prediction_id",
            get(handlers::get_prediction).delete(handlers::delete_prediction),
        )
        // Analytics
        .route(
            "/analytics/snapshots",
            get(handlers::list_snapshots).post(handlers::create_snapshot),
        )
        .route("/analytics/snapshots/latest", get(handlers::latest_snapshot))
        .route("/analytics/snapshots/:analytics_id", get(handlers::get_snapshot))
        // Document-store views
        .route("/documents/loans", get(handlers::document_loans))
        .route("/documents/predictions", get(handlers::document_predictions))
        // Reconciliation
        .route("/sync", post(handlers::sync_all))
        .route("/sync/:entity", post(handlers::sync_entity))
        .route("/sync/:entity/verify", get(handlers::verify_entity))
        // Model
        .route("/model", get(handlers::model_info))
        .route("/model/reload", post(handlers::reload_model))
        // Health
        .route("/health", get(handlers::health))
        .route("/", get(handlers::root))
        .with_state(state)
}
