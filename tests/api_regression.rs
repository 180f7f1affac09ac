//! API Regression Tests
//!
//! In-process tests that build the Axum app via `create_app()` and exercise
//! the loan, prediction, analytics, sync and health endpoints using
//! `tower::ServiceExt::oneshot()`. Stores are an in-memory SQLite pool and a
//! temporary sled database, so nothing touches the network or the disk.

use loan_pipeline::api::{create_app, ApiState};
use loan_pipeline::config::WriteMode;
use loan_pipeline::ml_engine::artifact::ARTIFACT_FORMAT_VERSION;
use loan_pipeline::ml_engine::{LogisticModel, ModelArtifact, PredictionEngine, TrainingMetadata};
use loan_pipeline::service::LoanService;
use loan_pipeline::storage::{DocumentStore, EntityKind, RecordStore, RelationalStore, StoreError};
use loan_pipeline::sync::SyncReconciler;
use loan_pipeline::types::{FEATURE_NAMES, NUM_FEATURES};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const MAX_PAYLOAD: usize = 64 * 1024;

/// Approves exactly when credit history is 1.
fn credit_history_model() -> LogisticModel {
    let mut weights = vec![0.0; NUM_FEATURES];
    weights[4] = 4.0;
    let mut importances = vec![0.0; NUM_FEATURES];
    importances[4] = 1.0;
    LogisticModel::from_artifact(ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        model_version: "logreg-api-test".into(),
        feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        weights,
        intercept: -2.0,
        scaler: None,
        feature_importances: Some(importances),
        metadata: TrainingMetadata::default(),
    })
    .unwrap()
}

struct Harness {
    app: Router,
    relational: Arc<RelationalStore>,
    document: Arc<DocumentStore>,
}

async fn harness(engine: PredictionEngine) -> Harness {
    let relational = Arc::new(RelationalStore::in_memory().await.unwrap());
    let document = Arc::new(DocumentStore::temporary().unwrap());
    let service = LoanService::new(
        relational.clone(),
        document.clone(),
        Arc::new(engine),
        WriteMode::WriteThrough,
    );
    let reconciler = SyncReconciler::new(relational.clone(), document.clone());
    let state = ApiState {
        service: Arc::new(service),
        reconciler: Arc::new(reconciler),
    };
    Harness {
        app: create_app(state, MAX_PAYLOAD),
        relational,
        document,
    }
}

async fn with_model() -> Harness {
    harness(PredictionEngine::with_classifier(Arc::new(credit_history_model()))).await
}

async fn without_model() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    harness(PredictionEngine::new(dir.path().join("missing.json"))).await
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn loan_body(loan_id: &str, credit_history: i64, status: &str) -> Value {
    json!({
        "loan_id": loan_id,
        "gender": "Male",
        "married": "Yes",
        "dependents": "1",
        "education": "Graduate",
        "self_employed": "No",
        "applicant_income": 4583.0,
        "coapplicant_income": 1508.0,
        "loan_amount": 128.0,
        "loan_amount_term": 360,
        "credit_history": credit_history,
        "property_area": "Rural",
        "loan_status": status,
    })
}

#[tokio::test]
async fn test_create_get_and_duplicate() {
    let h = with_model().await;

    let (status, v) = send(&h.app, Method::POST, "/loans/", Some(loan_body("LP001", 1, "Y"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(v["data"]["loan_id"], "LP001");
    assert_eq!(v["data"]["dependents"], "1");
    assert!(v["meta"]["timestamp"].is_string());

    let (status, v) = send(&h.app, Method::GET, "/loans/LP001", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["property_area"], "Rural");

    let (status, v) = send(&h.app, Method::POST, "/loans", Some(loan_body("LP001", 1, "Y"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(v["error"]["code"], "CONFLICT");

    // Write-through lands the record and its features in the mirror too
    assert!(h.document.get_application("LP001").await.is_ok());
    assert!(h.document.get_features("LP001").await.is_ok());
}

#[tokio::test]
async fn test_unknown_loan_is_404() {
    let h = with_model().await;
    for uri in ["/loans/NOPE", "/loans/NOPE/features", "/loans/NOPE/predictions"] {
        let (status, v) = send(&h.app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "GET {uri}");
        assert_eq!(v["error"]["code"], "NOT_FOUND");
    }
    let (status, _) = send(&h.app, Method::DELETE, "/loans/NOPE", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_payloads_are_400() {
    let h = with_model().await;

    let mut bad_category = loan_body("LP002", 1, "Y");
    bad_category["property_area"] = json!("Suburban");
    let (status, v) = send(&h.app, Method::POST, "/loans/", Some(bad_category)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(v["error"]["message"].as_str().unwrap().contains("property_area"));

    let mut bad_credit = loan_body("LP002", 1, "Y");
    bad_credit["credit_history"] = json!(2);
    let (status, _) = send(&h.app, Method::POST, "/loans/", Some(bad_credit)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, Method::POST, "/loans/", Some(loan_body("LP002", 1, "Y"))).await;
    assert_eq!(status, StatusCode::CREATED);

    // loan_id is immutable and not part of the patch whitelist
    let (status, _) = send(&h.app, Method::PUT, "/loans/LP002", Some(json!({"loan_id": "X"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, Method::GET, "/loans/?limit=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_rederives_features_and_delete_cascades() {
    let h = with_model().await;
    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP003", 0, "N"))).await;

    let (status, v) = send(&h.app, Method::GET, "/loans/LP003/features", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["features"]["credit_history"], 0.0);

    let (status, v) = send(
        &h.app,
        Method::PUT,
        "/loans/LP003",
        Some(json!({"credit_history": 1, "loan_status": "Y"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["credit_history"], 1);
    assert_eq!(v["data"]["loan_status"], "Y");

    let (_, v) = send(&h.app, Method::GET, "/loans/LP003/features", None).await;
    assert_eq!(v["data"]["features"]["credit_history"], 1.0);

    let (status, _) = send(&h.app, Method::POST, "/loans/LP003/predict", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, v) = send(&h.app, Method::DELETE, "/loans/LP003", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(v, Value::Null);

    assert!(matches!(
        h.relational.get_features("LP003").await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        h.document.get_application("LP003").await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        h.document.get_features("LP003").await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(h.document.export(EntityKind::Predictions).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_predictions_with_model() {
    let h = with_model().await;

    let mut payload = loan_body("IGNORED", 1, "Y");
    payload.as_object_mut().unwrap().remove("loan_id");
    payload.as_object_mut().unwrap().remove("loan_status");
    let (status, v) = send(&h.app, Method::POST, "/loans/predict/", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["predicted_status"], "Y");
    assert_eq!(v["data"]["model_version"], "logreg-api-test");
    assert_eq!(v["data"]["top_features"][0][0], "credit_history");
    let confidence = v["data"]["confidence_score"].as_f64().unwrap();
    assert!((0.5..=1.0).contains(&confidence));

    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP004", 0, "N"))).await;
    let (status, v) = send(&h.app, Method::POST, "/loans/LP004/predict", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(v["data"]["predicted_status"], "N");
    assert_eq!(v["data"]["loan_id"], "LP004");

    let (status, v) = send(&h.app, Method::GET, "/loans/LP004/predictions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"].as_array().unwrap().len(), 1);

    let (status, v) = send(&h.app, Method::GET, "/model", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["model_version"], "logreg-api-test");
}

#[tokio::test]
async fn test_predictions_without_model() {
    let h = without_model().await;

    let mut payload = loan_body("IGNORED", 1, "Y");
    payload.as_object_mut().unwrap().remove("loan_id");
    let (status, v) = send(&h.app, Method::POST, "/loans/predict", Some(payload)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(v["error"]["code"], "MODEL_UNAVAILABLE");

    // CRUD keeps working without a model
    let (status, _) = send(&h.app, Method::POST, "/loans/", Some(loan_body("LP005", 1, "Y"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, v) = send(&h.app, Method::POST, "/loans/LP005/predict", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(v["error"]["code"], "MODEL_UNAVAILABLE");

    let (status, v) = send(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["model_loaded"], false);
}

#[tokio::test]
async fn test_search_list_and_statistics() {
    let h = with_model().await;
    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP010", 1, "Y"))).await;
    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP011", 0, "N"))).await;
    let mut female = loan_body("LP012", 1, "Y");
    female["gender"] = json!("Female");
    female["applicant_income"] = json!(9000.0);
    send(&h.app, Method::POST, "/loans/", Some(female)).await;

    let (status, v) = send(&h.app, Method::GET, "/loans/?skip=1&limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["total"], 3);
    assert_eq!(v["data"]["items"].as_array().unwrap().len(), 1);
    assert_eq!(v["data"]["offset"], 1);

    let (status, v) = send(&h.app, Method::GET, "/loans/search/?gender=Female", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["total"], 1);
    assert_eq!(v["data"]["items"][0]["loan_id"], "LP012");

    let (_, v) = send(&h.app, Method::GET, "/loans/search?loan_status=Y&min_income=5000", None).await;
    assert_eq!(v["data"]["total"], 1);

    let (status, _) = send(&h.app, Method::GET, "/loans/search?gender=Unknown", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, v) = send(&h.app, Method::GET, "/loans/statistics/overview", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["total_applications"], 3);
    assert_eq!(v["data"]["approved_loans"], 2);
    assert_eq!(v["data"]["rejected_loans"], 1);
    assert_eq!(v["data"]["approval_rate"], 66.67);
    assert_eq!(v["data"]["gender_distribution"]["Male"], 2);
}

#[tokio::test]
async fn test_snapshots() {
    let h = with_model().await;

    let (status, _) = send(&h.app, Method::GET, "/analytics/snapshots/latest", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP020", 1, "Y"))).await;
    let (status, v) = send(&h.app, Method::POST, "/analytics/snapshots", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(v["data"]["total_applications"], 1);

    let (status, v) = send(&h.app, Method::GET, "/analytics/snapshots/latest", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["approval_rate"], 100.0);
}

#[tokio::test]
async fn test_lookups_by_id_and_feature_listing() {
    let h = with_model().await;
    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP040", 1, "Y"))).await;
    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP041", 0, "N"))).await;
    let (_, v) = send(&h.app, Method::POST, "/loans/LP040/predict", None).await;
    let prediction_id = v["data"]["prediction_id"].as_i64().unwrap();

    let uri = format!("/predictions/{prediction_id}");
    let (status, v) = send(&h.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["loan_id"], "LP040");

    let (status, v) = send(&h.app, Method::GET, "/predictions/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["error"]["code"], "BAD_REQUEST");

    let (status, _) = send(&h.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&h.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h
        .document
        .export(EntityKind::Predictions)
        .await
        .unwrap()
        .is_empty());

    let (status, v) = send(&h.app, Method::GET, "/features/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"].as_array().unwrap().len(), 2);
    let (_, v) = send(&h.app, Method::GET, "/features?skip=1&limit=1", None).await;
    assert_eq!(v["data"][0]["loan_id"], "LP041");
    let (_, v) = send(&h.app, Method::GET, "/features?derived_since=2999-01-01T00:00:00Z", None).await;
    assert!(v["data"].as_array().unwrap().is_empty());
    let (status, _) = send(&h.app, Method::GET, "/features?derived_since=yesterday", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, v) = send(&h.app, Method::POST, "/analytics/snapshots", None).await;
    let analytics_id = v["data"]["analytics_id"].as_i64().unwrap();
    let uri = format!("/analytics/snapshots/{analytics_id}");
    let (status, v) = send(&h.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["total_applications"], 2);
    let (status, _) = send(&h.app, Method::GET, "/analytics/snapshots/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    // Snapshots are immutable
    let (status, _) = send(&h.app, Method::PUT, &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_sync_and_verify() {
    let h = with_model().await;
    send(&h.app, Method::POST, "/loans/", Some(loan_body("LP030", 1, "Y"))).await;
    send(&h.app, Method::POST, "/loans/LP030/predict", None).await;

    // A record the mirror missed
    let mut other = h.relational.get_application("LP030").await.unwrap();
    other.loan_id = "LP031".into();
    h.relational.put_application(&other).await.unwrap();

    let (status, v) = send(&h.app, Method::GET, "/sync/applications/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["consistent"], false);
    assert_eq!(v["data"]["missing_in_destination"][0], "LP031");

    let (status, v) = send(&h.app, Method::POST, "/sync", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"].as_array().unwrap().len(), 4);
    assert_eq!(v["data"][0]["entity"], "applications");
    assert_eq!(v["data"][0]["inserted"], 2);

    for entity in ["applications", "predictions"] {
        let uri = format!("/sync/{entity}/verify");
        let (_, v) = send(&h.app, Method::GET, &uri, None).await;
        assert_eq!(v["data"]["consistent"], true, "{entity}");
    }

    let (_, v) = send(&h.app, Method::GET, "/documents/loans", None).await;
    assert_eq!(v["data"].as_array().unwrap().len(), 2);

    let (status, _) = send(&h.app, Method::POST, "/sync/customers", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_root() {
    let h = with_model().await;

    let (status, v) = send(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["status"], "healthy");
    assert_eq!(v["data"]["relational"]["status"], "healthy");
    assert_eq!(v["data"]["document"]["status"], "healthy");
    assert_eq!(v["data"]["model_loaded"], true);

    let (status, v) = send(&h.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["version"], env!("CARGO_PKG_VERSION"));
}
