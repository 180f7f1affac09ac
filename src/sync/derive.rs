//! Rebuild derived collections from the applications of one store

use serde::Serialize;
use tracing::{info, warn};

use crate::ml_engine::{FeatureEncoder, PredictionEngine, PredictionError};
use crate::storage::{ApplicationFilter, EntityKind, Page, RecordStore, StoreError};
use crate::types::{timestamp_now, FeatureRecord, NewSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct DeriveReport {
    pub applications: u64,
    pub features_written: u64,
    pub predictions_written: u64,
    /// `None` when no model could be loaded and scoring was skipped
    pub model_version: Option<String>,
    pub snapshot_id: i64,
}

/// Recompute every feature vector, score each application when a model is
/// available, and store a fresh analytics snapshot.
///
/// Feature vectors are replaced wholesale. Predictions are appended to the
/// history; nothing is fabricated when no model is loadable.
pub async fn rebuild_derived(
    store: &dyn RecordStore,
    engine: &PredictionEngine,
) -> Result<DeriveReport, StoreError> {
    let apps = store
        .list_applications(&ApplicationFilter::default(), Page::all())
        .await?;

    let cleared = store.clear(EntityKind::Features).await?;
    let derived_at = timestamp_now();
    for app in &apps {
        store
            .upsert_features(&FeatureRecord {
                loan_id: app.loan_id.clone(),
                features: FeatureEncoder::encode_profile(&app.profile),
                derived_at,
            })
            .await?;
    }
    info!(
        backend = %store.backend(),
        replaced = cleared,
        written = apps.len(),
        "Feature vectors rebuilt"
    );

    let (model_version, predictions_written) = match engine.model() {
        Ok(model) => {
            let mut written = 0u64;
            for app in &apps {
                match engine.predict_profile(&app.profile) {
                    Ok(result) => {
                        store
                            .create_prediction(&result.into_new_prediction(app.loan_id.as_str()))
                            .await?;
                        written += 1;
                    }
                    Err(PredictionError::Encoding(e)) => {
                        warn!(loan_id = %app.loan_id, error = %e, "Skipping unscorable application");
                    }
                    Err(e @ PredictionError::ModelUnavailable { .. }) => {
                        warn!(error = %e, "Model became unavailable during rebuild");
                        break;
                    }
                }
            }
            (Some(model.classifier.model_version().to_string()), written)
        }
        Err(e) => {
            warn!(error = %e, "No model available, predictions not generated");
            (None, 0)
        }
    };

    let statistics = store.statistics().await?;
    let snapshot = store
        .create_snapshot(&NewSnapshot {
            analysis_date: timestamp_now(),
            statistics,
        })
        .await?;

    info!(
        backend = %store.backend(),
        applications = apps.len(),
        predictions = predictions_written,
        snapshot_id = snapshot.analytics_id,
        "Derived collections rebuilt"
    );

    Ok(DeriveReport {
        applications: apps.len() as u64,
        features_written: apps.len() as u64,
        predictions_written,
        model_version,
        snapshot_id: snapshot.analytics_id,
    })
}
