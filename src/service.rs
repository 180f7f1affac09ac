//! Application workflows shared by the HTTP API and the CLI
//!
//! The relational store is primary: every write commits there first. Under
//! [`WriteMode::WriteThrough`] the same write is then mirrored to the document
//! store. The two writes are not atomic. If the mirror write fails the primary
//! change stays committed and the error is returned. Reconciling with the
//! relational store as source (the default `sync.source`) repairs the mirror;
//! reconciling in the other direction would discard the primary change.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::WriteMode;
use crate::ml_engine::{FeatureEncoder, PredictionEngine, PredictionError};
use crate::storage::{
    ApplicationFilter, Backend, FeatureFilter, Page, PredictionFilter, RecordStore, StoreError,
};
use crate::types::{
    timestamp_now, AnalyticsSnapshot, ApplicationPatch, ApplicationStatistics, FeatureRecord,
    LoanApplication, NewApplication, NewApplicationRequest, NewSnapshot, Prediction,
    PredictionResult, RawApplication, ValidationError,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

impl From<ValidationError> for ServiceError {
    fn from(e: ValidationError) -> Self {
        Self::Store(StoreError::Validation(e))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Reachability of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: Backend,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub relational: BackendHealth,
    pub document: BackendHealth,
    pub model_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// A stored prediction together with the inference details behind it.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredApplication {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub top_features: Vec<(String, f64)>,
}

/// Outcome of a JSON-lines import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: u64,
    pub duplicates: u64,
    pub invalid: u64,
    /// `line: reason` for each rejected row
    pub rejected: Vec<String>,
}

pub struct LoanService {
    primary: Arc<dyn RecordStore>,
    mirror: Arc<dyn RecordStore>,
    engine: Arc<PredictionEngine>,
    write_mode: WriteMode,
}

impl LoanService {
    pub fn new(
        primary: Arc<dyn RecordStore>,
        mirror: Arc<dyn RecordStore>,
        engine: Arc<PredictionEngine>,
        write_mode: WriteMode,
    ) -> Self {
        info!(
            primary = %primary.backend(),
            mirror = %mirror.backend(),
            write_mode = ?write_mode,
            "Loan service ready"
        );
        Self {
            primary,
            mirror,
            engine,
            write_mode,
        }
    }

    pub fn primary(&self) -> &Arc<dyn RecordStore> {
        &self.primary
    }

    pub fn mirror(&self) -> &Arc<dyn RecordStore> {
        &self.mirror
    }

    pub fn engine(&self) -> &Arc<PredictionEngine> {
        &self.engine
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn mirrors_writes(&self) -> bool {
        self.write_mode == WriteMode::WriteThrough
    }

    fn features_of(app: &LoanApplication) -> FeatureRecord {
        FeatureRecord {
            loan_id: app.loan_id.clone(),
            features: FeatureEncoder::encode_profile(&app.profile),
            derived_at: app.updated_at,
        }
    }

    async fn mirror_application(&self, app: &LoanApplication, features: &FeatureRecord) -> ServiceResult<()> {
        if !self.mirrors_writes() {
            return Ok(());
        }
        let result = async {
            self.mirror.put_application(app).await?;
            self.mirror.upsert_features(features).await
        }
        .await;
        if let Err(e) = &result {
            warn!(loan_id = %app.loan_id, error = %e, "Mirror write failed; primary committed");
        }
        Ok(result?)
    }

    // --- applications ---

    /// Store a new application and its feature vector.
    pub async fn create_application(&self, new: NewApplication) -> ServiceResult<LoanApplication> {
        new.validate()?;
        let app = new.into_application(timestamp_now());
        let features = Self::features_of(&app);

        self.primary.create_application(&app).await?;
        self.primary.upsert_features(&features).await?;
        self.mirror_application(&app, &features).await?;

        info!(loan_id = %app.loan_id, "Application created");
        Ok(app)
    }

    pub async fn get_application(&self, loan_id: &str) -> ServiceResult<LoanApplication> {
        Ok(self.primary.get_application(loan_id).await?)
    }

    pub async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: Page,
    ) -> ServiceResult<Vec<LoanApplication>> {
        Ok(self.primary.list_applications(filter, page).await?)
    }

    pub async fn count_applications(&self, filter: &ApplicationFilter) -> ServiceResult<u64> {
        Ok(self.primary.count_applications(filter).await?)
    }

    /// Apply a partial update and re-derive the feature vector.
    pub async fn update_application(
        &self,
        loan_id: &str,
        patch: &ApplicationPatch,
    ) -> ServiceResult<LoanApplication> {
        let app = self.primary.update_application(loan_id, patch).await?;
        let features = Self::features_of(&app);
        self.primary.upsert_features(&features).await?;
        self.mirror_application(&app, &features).await?;
        debug!(loan_id, "Application updated, features re-derived");
        Ok(app)
    }

    /// Delete an application with its features and predictions in both stores.
    pub async fn delete_application(&self, loan_id: &str) -> ServiceResult<()> {
        cascade_delete(self.primary.as_ref(), loan_id).await?;
        if self.mirrors_writes() {
            match cascade_delete(self.mirror.as_ref(), loan_id).await {
                Ok(()) => {}
                // Stale mirror: the dependents may still exist
                Err(StoreError::NotFound { .. }) => {
                    self.mirror.delete_features(loan_id).await?;
                    self.mirror.delete_predictions_for(loan_id).await?;
                }
                Err(e) => {
                    warn!(loan_id, error = %e, "Mirror delete failed; primary committed");
                    return Err(e.into());
                }
            }
        }
        info!(loan_id, "Application deleted");
        Ok(())
    }

    pub async fn get_features(&self, loan_id: &str) -> ServiceResult<FeatureRecord> {
        Ok(self.primary.get_features(loan_id).await?)
    }

    pub async fn list_features(
        &self,
        filter: &FeatureFilter,
        page: Page,
    ) -> ServiceResult<Vec<FeatureRecord>> {
        Ok(self.primary.list_features(filter, page).await?)
    }

    // --- predictions ---

    /// Score an application payload without storing anything.
    pub fn predict_payload(&self, raw: &RawApplication) -> ServiceResult<PredictionResult> {
        Ok(self.engine.predict(raw)?)
    }

    /// Score a stored application and append the result to its history.
    pub async fn predict_stored(&self, loan_id: &str) -> ServiceResult<ScoredApplication> {
        let app = self.primary.get_application(loan_id).await?;
        let result = self.engine.predict_profile(&app.profile)?;
        let top_features = result.top_features(5);
        let new = result.into_new_prediction(loan_id);

        let prediction = self.primary.create_prediction(&new).await?;
        if self.mirrors_writes() {
            if let Err(e) = self.mirror.create_prediction(&new).await {
                warn!(loan_id, error = %e, "Mirror prediction write failed; primary committed");
                return Err(e.into());
            }
        }

        info!(
            loan_id,
            prediction_id = prediction.prediction_id,
            status = %prediction.predicted_status,
            confidence = prediction.confidence_score,
            "Prediction stored"
        );
        Ok(ScoredApplication {
            prediction,
            top_features,
        })
    }

    pub async fn get_prediction(&self, prediction_id: i64) -> ServiceResult<Prediction> {
        Ok(self.primary.get_prediction(prediction_id).await?)
    }

    /// Delete one prediction by its primary id.
    ///
    /// Ids are generated per backend, so the mirror copy is located by
    /// identity key. A mirror that never received it is not an error.
    pub async fn delete_prediction(&self, prediction_id: i64) -> ServiceResult<()> {
        let prediction = self.primary.get_prediction(prediction_id).await?;
        self.primary.delete_prediction(prediction_id).await?;
        if self.mirrors_writes() {
            let identity = prediction.identity_key();
            let copies = self
                .mirror
                .list_predictions(&PredictionFilter::for_loan(&prediction.loan_id), Page::all())
                .await?;
            for copy in copies.iter().filter(|p| p.identity_key() == identity) {
                if let Err(e) = self.mirror.delete_prediction(copy.prediction_id).await {
                    warn!(prediction_id, error = %e, "Mirror prediction delete failed; primary committed");
                    return Err(e.into());
                }
            }
        }
        info!(prediction_id, loan_id = %prediction.loan_id, "Prediction deleted");
        Ok(())
    }

    /// Prediction history of one application, oldest first.
    pub async fn prediction_history(&self, loan_id: &str, page: Page) -> ServiceResult<Vec<Prediction>> {
        // 404 for unknown applications rather than an empty list
        self.primary.get_application(loan_id).await?;
        Ok(self
            .primary
            .list_predictions(&PredictionFilter::for_loan(loan_id), page)
            .await?)
    }

    // --- analytics ---

    pub async fn statistics(&self) -> ServiceResult<ApplicationStatistics> {
        Ok(self.primary.statistics().await?)
    }

    /// Persist an immutable snapshot of the current statistics.
    pub async fn create_snapshot(&self) -> ServiceResult<AnalyticsSnapshot> {
        let snapshot = NewSnapshot {
            analysis_date: timestamp_now(),
            statistics: self.primary.statistics().await?,
        };
        let stored = self.primary.create_snapshot(&snapshot).await?;
        if self.mirrors_writes() {
            self.mirror.create_snapshot(&snapshot).await?;
        }
        info!(
            analytics_id = stored.analytics_id,
            total = stored.statistics.total_applications,
            "Analytics snapshot stored"
        );
        Ok(stored)
    }

    pub async fn latest_snapshot(&self) -> ServiceResult<AnalyticsSnapshot> {
        self.primary
            .latest_snapshot()
            .await?
            .ok_or_else(|| StoreError::not_found(crate::storage::EntityKind::Analytics.record_name(), "latest").into())
    }

    pub async fn get_snapshot(&self, analytics_id: i64) -> ServiceResult<AnalyticsSnapshot> {
        Ok(self.primary.get_snapshot(analytics_id).await?)
    }

    pub async fn list_snapshots(&self, page: Page) -> ServiceResult<Vec<AnalyticsSnapshot>> {
        Ok(self.primary.list_snapshots(page).await?)
    }

    // --- document views ---

    pub async fn mirror_applications(
        &self,
        filter: &ApplicationFilter,
        page: Page,
    ) -> ServiceResult<Vec<LoanApplication>> {
        Ok(self.mirror.list_applications(filter, page).await?)
    }

    pub async fn mirror_predictions(
        &self,
        filter: &PredictionFilter,
        page: Page,
    ) -> ServiceResult<Vec<Prediction>> {
        Ok(self.mirror.list_predictions(filter, page).await?)
    }

    // --- bulk ---

    /// Import JSON-lines application records, one create per line.
    ///
    /// Blank lines are skipped. Duplicates and invalid rows are reported,
    /// never fatal; store outages abort the import.
    pub async fn import_lines(&self, text: &str) -> ServiceResult<ImportReport> {
        let mut report = ImportReport::default();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() {
                continue;
            }
            let new = match serde_json::from_str::<NewApplicationRequest>(line)
                .map_err(|e| e.to_string())
                .and_then(|req| req.validate().map_err(|e| e.to_string()))
            {
                Ok(new) => new,
                Err(reason) => {
                    report.invalid += 1;
                    report.rejected.push(format!("{line_no}: {reason}"));
                    continue;
                }
            };
            match self.create_application(new).await {
                Ok(_) => report.imported += 1,
                Err(ServiceError::Store(e @ StoreError::DuplicateKey { .. })) => {
                    report.duplicates += 1;
                    report.rejected.push(format!("{line_no}: {e}"));
                }
                Err(ServiceError::Store(StoreError::Validation(e))) => {
                    report.invalid += 1;
                    report.rejected.push(format!("{line_no}: {e}"));
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            imported = report.imported,
            duplicates = report.duplicates,
            invalid = report.invalid,
            "Import finished"
        );
        Ok(report)
    }

    // --- health ---

    pub async fn health(&self) -> HealthReport {
        let check = |store: &Arc<dyn RecordStore>| {
            let store = Arc::clone(store);
            async move {
                match store.ping().await {
                    Ok(()) => BackendHealth {
                        backend: store.backend(),
                        status: "healthy",
                        message: None,
                    },
                    Err(e) => {
                        warn!(backend = %store.backend(), error = %e, "Health check failed");
                        BackendHealth {
                            backend: store.backend(),
                            status: "unhealthy",
                            message: Some(e.to_string()),
                        }
                    }
                }
            }
        };
        let (primary, mirror) = tokio::join!(check(&self.primary), check(&self.mirror));
        let (relational, document) = if primary.backend == Backend::Relational {
            (primary, mirror)
        } else {
            (mirror, primary)
        };
        let info = self.engine.info();
        let status = if relational.status == "healthy" && document.status == "healthy" {
            "healthy"
        } else {
            "unhealthy"
        };
        HealthReport {
            status,
            relational,
            document,
            model_loaded: info.is_some(),
            model_version: info.map(|i| i.model_version),
        }
    }
}

/// Delete an application, removing dependents explicitly where the store
/// does not cascade.
async fn cascade_delete(store: &dyn RecordStore, loan_id: &str) -> Result<(), StoreError> {
    store.delete_application(loan_id).await?;
    if !store.cascades_deletes() {
        let had_features = store.delete_features(loan_id).await?;
        let predictions = store.delete_predictions_for(loan_id).await?;
        debug!(
            backend = %store.backend(),
            loan_id,
            had_features,
            predictions,
            "Removed dependents explicitly"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::ml_engine::LogisticModel;
    use crate::storage::{DocumentStore, EntityKind, RelationalStore};
    use crate::sync::SyncReconciler;
    use crate::types::{LoanStatus, NewPrediction, PropertyArea};

    fn request(loan_id: &str, credit: i64) -> NewApplication {
        serde_json::from_value::<NewApplicationRequest>(serde_json::json!({
            "loan_id": loan_id,
            "gender": "Male",
            "married": "No",
            "dependents": "0",
            "education": "Graduate",
            "self_employed": "No",
            "applicant_income": 5000.0,
            "coapplicant_income": 0.0,
            "loan_amount": 100.0,
            "loan_amount_term": 360,
            "credit_history": credit,
            "property_area": "Urban"
        }))
        .unwrap()
        .validate()
        .unwrap()
    }

    async fn service(mode: WriteMode, with_model: bool) -> LoanService {
        let engine = if with_model {
            let model = LogisticModel::from_artifact(
                crate::ml_engine::artifact::tests::credit_history_artifact(),
            )
            .unwrap();
            PredictionEngine::with_classifier(Arc::new(model))
        } else {
            PredictionEngine::new("/nonexistent/model.json")
        };
        LoanService::new(
            Arc::new(RelationalStore::in_memory().await.unwrap()),
            Arc::new(DocumentStore::temporary().unwrap()),
            Arc::new(engine),
            mode,
        )
    }

    #[tokio::test]
    async fn test_create_writes_through_with_features() {
        let svc = service(WriteMode::WriteThrough, false).await;
        let app = svc.create_application(request("L1", 1)).await.unwrap();

        assert_eq!(svc.mirror().get_application("L1").await.unwrap(), app);
        let features = svc.get_features("L1").await.unwrap();
        assert!((features.features.income_to_loan_ratio - 50.0).abs() < 1e-9);
        assert_eq!(svc.mirror().get_features("L1").await.unwrap(), features);
    }

    #[tokio::test]
    async fn test_primary_only_leaves_mirror_untouched() {
        let svc = service(WriteMode::PrimaryOnly, false).await;
        svc.create_application(request("L1", 1)).await.unwrap();
        assert!(svc.mirror().get_application("L1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_rederives_features() {
        let svc = service(WriteMode::WriteThrough, false).await;
        svc.create_application(request("L1", 1)).await.unwrap();
        let patch = ApplicationPatch {
            loan_amount: Some(200.0),
            property_area: Some(PropertyArea::Rural),
            ..Default::default()
        };
        svc.update_application("L1", &patch).await.unwrap();

        let features = svc.get_features("L1").await.unwrap().features;
        assert_eq!(features.loan_amount, 200.0);
        assert_eq!(features.property_area_code, 2.0);
        assert!((features.income_to_loan_ratio - 25.0).abs() < 1e-9);
        let mirrored = svc.mirror().get_features("L1").await.unwrap().features;
        assert_eq!(mirrored, features);
    }

    #[tokio::test]
    async fn test_delete_cascades_in_both_stores() {
        let svc = service(WriteMode::WriteThrough, true).await;
        svc.create_application(request("L1", 1)).await.unwrap();
        svc.predict_stored("L1").await.unwrap();

        svc.delete_application("L1").await.unwrap();
        for store in [svc.primary(), svc.mirror()] {
            assert!(store.get_application("L1").await.unwrap_err().is_not_found());
            assert!(store.get_features("L1").await.unwrap_err().is_not_found());
            let left = store
                .list_predictions(&PredictionFilter::for_loan("L1"), Page::all())
                .await
                .unwrap();
            assert!(left.is_empty());
        }
        let err = svc.delete_application("L1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_predict_stored_appends_history() {
        let svc = service(WriteMode::WriteThrough, true).await;
        svc.create_application(request("GOOD", 1)).await.unwrap();
        let first = svc.predict_stored("GOOD").await.unwrap();
        let second = svc.predict_stored("GOOD").await.unwrap();

        assert_eq!(first.prediction.predicted_status, LoanStatus::Approved);
        assert_eq!(first.top_features[0].0, "credit_history");
        let history = svc.prediction_history("GOOD", Page::all()).await.unwrap();
        assert_eq!(
            history.iter().map(|p| p.prediction_id).collect::<Vec<_>>(),
            vec![first.prediction.prediction_id, second.prediction.prediction_id]
        );
        assert!(svc
            .prediction_history("MISSING", Page::all())
            .await
            .unwrap_err()
            .to_string()
            .contains("not found"));
    }

    #[tokio::test]
    async fn test_default_reconcile_repairs_mirror_without_touching_primary() {
        let svc = service(WriteMode::WriteThrough, true).await;
        svc.create_application(request("L1", 1)).await.unwrap();
        let stored = svc.predict_stored("L1").await.unwrap();

        // Mirror write lost after the primary committed
        svc.mirror().delete_predictions_for("L1").await.unwrap();

        let reconciler = SyncReconciler::from_source(
            SyncConfig::default().source,
            svc.primary().clone(),
            svc.mirror().clone(),
        );
        reconciler.reconcile_many(&EntityKind::DERIVED).await.unwrap();

        let history = svc.prediction_history("L1", Page::all()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].prediction_id, stored.prediction.prediction_id);
        let mirrored = svc
            .mirror()
            .list_predictions(&PredictionFilter::for_loan("L1"), Page::all())
            .await
            .unwrap();
        assert_eq!(mirrored, history);
    }

    #[tokio::test]
    async fn test_delete_prediction_removes_mirror_copy_by_identity() {
        let svc = service(WriteMode::WriteThrough, true).await;
        svc.create_application(request("L1", 1)).await.unwrap();
        // Mirror-only record shifts the mirror's id sequence
        svc.mirror()
            .create_prediction(&NewPrediction {
                loan_id: "L1".into(),
                predicted_status: LoanStatus::Rejected,
                confidence_score: 0.6,
                probability_approved: 0.4,
                model_version: "older".into(),
                feature_importance: None,
                prediction_created_at: timestamp_now(),
            })
            .await
            .unwrap();
        let kept = svc.predict_stored("L1").await.unwrap().prediction;
        let dropped = svc.predict_stored("L1").await.unwrap().prediction;

        svc.delete_prediction(dropped.prediction_id).await.unwrap();

        assert!(matches!(
            svc.get_prediction(dropped.prediction_id).await,
            Err(ServiceError::Store(StoreError::NotFound { .. }))
        ));
        let mirrored: Vec<String> = svc
            .mirror()
            .list_predictions(&PredictionFilter::for_loan("L1"), Page::all())
            .await
            .unwrap()
            .iter()
            .map(Prediction::identity_key)
            .collect();
        assert_eq!(mirrored.len(), 2);
        assert!(mirrored.contains(&kept.identity_key()));
        assert!(!mirrored.contains(&dropped.identity_key()));
        assert!(matches!(
            svc.delete_prediction(dropped.prediction_id).await,
            Err(ServiceError::Store(StoreError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_predict_without_model_is_infrastructure_error() {
        let svc = service(WriteMode::WriteThrough, false).await;
        svc.create_application(request("L1", 1)).await.unwrap();
        let err = svc.predict_stored("L1").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Prediction(PredictionError::ModelUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_import_reports_rejections() {
        let svc = service(WriteMode::WriteThrough, false).await;
        let good = serde_json::to_string(&serde_json::json!({
            "loan_id": "IMP1", "gender": "Female", "married": "Yes", "dependents": "3+",
            "education": "Not Graduate", "self_employed": "No", "applicant_income": 2000,
            "coapplicant_income": 1000, "property_area": "Semiurban", "loan_status": "Y"
        }))
        .unwrap();
        let bad = r#"{"loan_id": "IMP2", "gender": "Unknown"}"#;
        let text = format!("{good}\n\n{bad}\n{good}\n");

        let report = svc.import_lines(&text).await.unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.invalid, 1);
        assert_eq!(report.duplicates, 1);
        assert!(report.rejected[0].starts_with("3:"));
        assert!(report.rejected[1].starts_with("4:"));
    }

    #[tokio::test]
    async fn test_health_reports_both_backends() {
        let svc = service(WriteMode::WriteThrough, true).await;
        let health = svc.health().await;
        assert!(health.is_healthy());
        assert_eq!(health.relational.backend, Backend::Relational);
        assert_eq!(health.document.backend, Backend::Document);
        assert_eq!(health.model_version.as_deref(), Some("logreg-test"));
    }
}
