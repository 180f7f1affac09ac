//! Mapping of domain errors onto HTTP responses

use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use super::envelope::ApiErrorResponse;
use crate::ml_engine::PredictionError;
use crate::service::ServiceError;
use crate::storage::StoreError;
use crate::sync::SyncError;
use crate::types::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request body or query string.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Service(e.into())
    }
}

impl From<PredictionError> for ApiError {
    fn from(e: PredictionError) -> Self {
        Self::Service(e.into())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Service(e.into())
    }
}

fn store_response(e: &StoreError) -> Response {
    match e {
        StoreError::Validation(v) => {
            debug!(error = %v, "Rejected invalid request");
            ApiErrorResponse::bad_request(v.to_string())
        }
        StoreError::NotFound { .. } => ApiErrorResponse::not_found(e.to_string()),
        StoreError::DuplicateKey { .. } => ApiErrorResponse::conflict(e.to_string()),
        StoreError::Unavailable { .. } => {
            warn!(error = %e, "Store unavailable");
            ApiErrorResponse::service_unavailable(e.to_string())
        }
        StoreError::Corrupt { .. } => {
            error!(error = %e, "Corrupt record");
            ApiErrorResponse::internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::BadRequest(msg) => {
                debug!(error = %msg, "Rejected malformed request");
                ApiErrorResponse::bad_request(msg.clone())
            }
            ApiError::Service(ServiceError::Store(e)) => store_response(e),
            ApiError::Service(ServiceError::Prediction(PredictionError::Encoding(v))) => {
                debug!(error = %v, "Rejected unencodable application");
                ApiErrorResponse::bad_request(v.to_string())
            }
            ApiError::Service(ServiceError::Prediction(e @ PredictionError::ModelUnavailable { .. })) => {
                error!(error = %e, "Prediction model unavailable");
                ApiErrorResponse::model_unavailable(e.to_string())
            }
            ApiError::Sync(e) => {
                error!(error = %e, "Reconciliation failed");
                ApiErrorResponse::build(
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "SYNC_FAILED",
                    e.to_string(),
                )
            }
        }
    }
}

pub type ApiResult<T = Response> = Result<T, ApiError>;
