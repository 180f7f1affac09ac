//! HTTP handlers. Each returns a `{data, meta}` envelope or an [`ApiError`].
//!
//! JSON bodies are taken as raw values and deserialized here so that
//! malformed input gets the same error envelope as a domain violation.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::envelope::ApiResponse;
use super::error::{ApiError, ApiResult};
use crate::config::defaults;
use crate::service::LoanService;
use crate::storage::{ApplicationFilter, EntityKind, FeatureFilter, Page, PredictionFilter};
use crate::sync::SyncReconciler;
use crate::types::{
    ApplicationPatch, Education, Gender, LoanStatus, NewApplicationRequest, PredictionResult,
    PropertyArea, RawApplication, ValidationError,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<LoanService>,
    pub reconciler: Arc<SyncReconciler>,
}

// ============================================================================
// Request parsing
// ============================================================================

fn parse_body<T: DeserializeOwned>(body: Result<Json<Value>, JsonRejection>) -> ApiResult<T> {
    let Json(value) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    serde_json::from_value(value).map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

fn parse_query<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(q)| q)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// Resolve an optional `limit` against its default and upper bound.
fn bounded_limit(limit: Option<u32>, default: u32, max: u32) -> ApiResult<u64> {
    match limit.unwrap_or(default) {
        n if (1..=max).contains(&n) => Ok(u64::from(n)),
        n => Err(ValidationError::new("limit", format!("{n} is outside 1..={max}")).into()),
    }
}

fn parse_entity(entity: &str) -> ApiResult<EntityKind> {
    Ok(entity.parse::<EntityKind>()?)
}

fn parse_id(field: &'static str, raw: &str) -> ApiResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| ValidationError::new(field, format!("'{raw}' is not an integer id")).into())
}

// ============================================================================
// Loans
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub skip: Option<u64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct LoanPage<T: Serialize> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// `GET /loans/`
pub async fn list_loans(
    State(state): State<ApiState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult {
    let q = parse_query(query)?;
    let limit = bounded_limit(q.limit, defaults::LIST_LIMIT, defaults::LIST_LIMIT_MAX)?;
    let offset = q.skip.unwrap_or(0);
    let filter = ApplicationFilter::default();
    let items = state
        .service
        .list_applications(&filter, Page::new(offset, limit))
        .await?;
    let total = state.service.count_applications(&filter).await?;
    Ok(ApiResponse::ok(LoanPage {
        items,
        total,
        offset,
        limit,
    }))
}

/// `POST /loans/`
pub async fn create_loan(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let request: NewApplicationRequest = parse_body(body)?;
    let app = state.service.create_application(request.validate()?).await?;
    Ok(ApiResponse::created(app))
}

/// `GET /loans/:loan_id`
pub async fn get_loan(State(state): State<ApiState>, Path(loan_id): Path<String>) -> ApiResult {
    Ok(ApiResponse::ok(state.service.get_application(&loan_id).await?))
}

/// `PUT /loans/:loan_id` (partial update)
pub async fn update_loan(
    State(state): State<ApiState>,
    Path(loan_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let patch: ApplicationPatch = parse_body(body)?;
    let app = state.service.update_application(&loan_id, &patch).await?;
    Ok(ApiResponse::ok(app))
}

/// `DELETE /loans/:loan_id`
pub async fn delete_loan(State(state): State<ApiState>, Path(loan_id): Path<String>) -> ApiResult {
    state.service.delete_application(&loan_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /loans/:loan_id/features`
pub async fn get_features(State(state): State<ApiState>, Path(loan_id): Path<String>) -> ApiResult {
    Ok(ApiResponse::ok(state.service.get_features(&loan_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct FeaturesQuery {
    pub skip: Option<u64>,
    pub limit: Option<u32>,
    pub derived_since: Option<DateTime<Utc>>,
}

/// `GET /features/`
pub async fn list_features(
    State(state): State<ApiState>,
    query: Result<Query<FeaturesQuery>, QueryRejection>,
) -> ApiResult {
    let q = parse_query(query)?;
    let limit = bounded_limit(q.limit, defaults::LIST_LIMIT, defaults::LIST_LIMIT_MAX)?;
    let filter = FeatureFilter {
        derived_since: q.derived_since,
    };
    let page = Page::new(q.skip.unwrap_or(0), limit);
    Ok(ApiResponse::ok(state.service.list_features(&filter, page).await?))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub gender: Option<Gender>,
    pub education: Option<Education>,
    pub property_area: Option<PropertyArea>,
    pub loan_status: Option<LoanStatus>,
    pub min_income: Option<f64>,
    pub max_income: Option<f64>,
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

/// `GET /loans/search/`
pub async fn search_loans(
    State(state): State<ApiState>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult {
    let q = parse_query(query)?;
    let limit = bounded_limit(q.limit, defaults::SEARCH_LIMIT, defaults::SEARCH_LIMIT_MAX)?;
    let offset = q.offset.unwrap_or(0);
    let filter = ApplicationFilter {
        gender: q.gender,
        education: q.education,
        property_area: q.property_area,
        loan_status: q.loan_status,
        min_income: q.min_income,
        max_income: q.max_income,
    };
    let items = state
        .service
        .list_applications(&filter, Page::new(offset, limit))
        .await?;
    let total = state.service.count_applications(&filter).await?;
    Ok(ApiResponse::ok(LoanPage {
        items,
        total,
        offset,
        limit,
    }))
}

/// `GET /loans/statistics/overview`
pub async fn statistics_overview(State(state): State<ApiState>) -> ApiResult {
    Ok(ApiResponse::ok(state.service.statistics().await?))
}

// ============================================================================
// Predictions
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    #[serde(flatten)]
    pub result: PredictionResult,
    pub top_features: Vec<(String, f64)>,
}

/// `POST /loans/predict/`: score a payload without persisting it.
pub async fn predict_payload(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let raw: RawApplication = parse_body(body)?;
    let result = state.service.predict_payload(&raw)?;
    let top_features = result.top_features(5);
    Ok(ApiResponse::ok(PredictionResponse {
        result,
        top_features,
    }))
}

/// `POST /loans/:loan_id/predict`: score a stored application and persist the result.
pub async fn predict_stored(State(state): State<ApiState>, Path(loan_id): Path<String>) -> ApiResult {
    Ok(ApiResponse::created(state.service.predict_stored(&loan_id).await?))
}

/// `GET /loans/:loan_id/predictions`
pub async fn list_predictions(
    State(state): State<ApiState>,
    Path(loan_id): Path<String>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult {
    let q = parse_query(query)?;
    let limit = bounded_limit(q.limit, defaults::LIST_LIMIT, defaults::LIST_LIMIT_MAX)?;
    let page = Page::new(q.skip.unwrap_or(0), limit);
    Ok(ApiResponse::ok(
        state.service.prediction_history(&loan_id, page).await?,
    ))
}

/// `GET /predictions/:prediction_id`
pub async fn get_prediction(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id("prediction_id", &id)?;
    Ok(ApiResponse::ok(state.service.get_prediction(id).await?))
}

/// `DELETE /predictions/:prediction_id`
pub async fn delete_prediction(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id("prediction_id", &id)?;
    state.service.delete_prediction(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============================================================================
// Analytics
// ============================================================================

/// `POST /analytics/snapshots`
pub async fn create_snapshot(State(state): State<ApiState>) -> ApiResult {
    Ok(ApiResponse::created(state.service.create_snapshot().await?))
}

/// `GET /analytics/snapshots/latest`
pub async fn latest_snapshot(State(state): State<ApiState>) -> ApiResult {
    Ok(ApiResponse::ok(state.service.latest_snapshot().await?))
}

/// `GET /analytics/snapshots/:analytics_id`
pub async fn get_snapshot(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id("analytics_id", &id)?;
    Ok(ApiResponse::ok(state.service.get_snapshot(id).await?))
}

/// `GET /analytics/snapshots`
pub async fn list_snapshots(
    State(state): State<ApiState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult {
    let q = parse_query(query)?;
    let limit = bounded_limit(q.limit, defaults::LIST_LIMIT, defaults::LIST_LIMIT_MAX)?;
    let page = Page::new(q.skip.unwrap_or(0), limit);
    Ok(ApiResponse::ok(state.service.list_snapshots(page).await?))
}

// ============================================================================
// Document-store views
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DocumentLoansQuery {
    pub loan_status: Option<LoanStatus>,
    pub limit: Option<u32>,
}

/// `GET /documents/loans`
pub async fn document_loans(
    State(state): State<ApiState>,
    query: Result<Query<DocumentLoansQuery>, QueryRejection>,
) -> ApiResult {
    let q = parse_query(query)?;
    let limit = bounded_limit(
        q.limit,
        defaults::DOCUMENT_VIEW_LIMIT,
        defaults::DOCUMENT_VIEW_LIMIT_MAX,
    )?;
    let filter = ApplicationFilter {
        loan_status: q.loan_status,
        ..Default::default()
    };
    Ok(ApiResponse::ok(
        state
            .service
            .mirror_applications(&filter, Page::new(0, limit))
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct DocumentPredictionsQuery {
    pub loan_id: Option<String>,
    pub model_version: Option<String>,
    pub limit: Option<u32>,
}

/// `GET /documents/predictions`
pub async fn document_predictions(
    State(state): State<ApiState>,
    query: Result<Query<DocumentPredictionsQuery>, QueryRejection>,
) -> ApiResult {
    let q = parse_query(query)?;
    let limit = bounded_limit(
        q.limit,
        defaults::DOCUMENT_VIEW_LIMIT,
        defaults::DOCUMENT_VIEW_LIMIT_MAX,
    )?;
    let filter = PredictionFilter {
        loan_id: q.loan_id,
        model_version: q.model_version,
    };
    Ok(ApiResponse::ok(
        state
            .service
            .mirror_predictions(&filter, Page::new(0, limit))
            .await?,
    ))
}

// ============================================================================
// Sync
// ============================================================================

/// `POST /sync`: reconcile every entity kind, parents first.
pub async fn sync_all(State(state): State<ApiState>) -> ApiResult {
    let reports = state.reconciler.reconcile_all().await?;
    Ok(ApiResponse::ok(reports))
}

/// `POST /sync/:entity`
pub async fn sync_entity(State(state): State<ApiState>, Path(entity): Path<String>) -> ApiResult {
    let kind = parse_entity(&entity)?;
    Ok(ApiResponse::ok(state.reconciler.reconcile(kind).await?))
}

/// `GET /sync/:entity/verify`
pub async fn verify_entity(State(state): State<ApiState>, Path(entity): Path<String>) -> ApiResult {
    let kind = parse_entity(&entity)?;
    Ok(ApiResponse::ok(state.reconciler.verify(kind).await?))
}

// ============================================================================
// Model
// ============================================================================

/// `GET /model`: loads the artifact on first use.
pub async fn model_info(State(state): State<ApiState>) -> ApiResult {
    let engine = state.service.engine();
    let model = engine.model()?;
    Ok(ApiResponse::ok(crate::ml_engine::ModelInfo::from(model.as_ref())))
}

/// `POST /model/reload`
pub async fn reload_model(State(state): State<ApiState>) -> ApiResult {
    let info = state.service.engine().reload()?;
    info!(model_version = %info.model_version, "Model reloaded via API");
    Ok(ApiResponse::ok(info))
}

// ============================================================================
// Health
// ============================================================================

/// `GET /health`: 200 when both backends respond, 503 otherwise.
pub async fn health(State(state): State<ApiState>) -> Response {
    let report = state.service.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    ApiResponse::with_status(status, report)
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// `GET /`
pub async fn root() -> Response {
    ApiResponse::ok(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
