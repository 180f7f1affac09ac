//! Prediction engine: encode → infer → explain
//!
//! The classifier is loaded once and shared read-only between requests. The
//! first caller that finds the cache empty takes the load guard; concurrent
//! callers wait on the guard and then observe the cached model instead of
//! loading the artifact a second time. A failed load is not cached, so a
//! model trained after startup is picked up by the next request.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::artifact::{ArtifactError, LogisticModel, TrainingMetadata};
use super::classifier::{Capabilities, Classifier};
use super::encoder::FeatureEncoder;
use crate::types::{
    timestamp_now, ApplicantProfile, FeatureVector, LoanStatus, PredictionResult, RawApplication,
    ValidationError, FEATURE_NAMES,
};

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    /// The input failed feature encoding. A client fault.
    #[error("invalid application: {0}")]
    Encoding(#[from] ValidationError),

    /// No usable model artifact. An infrastructure fault.
    #[error("prediction model unavailable at {path}: {reason}")]
    ModelUnavailable { path: PathBuf, reason: String },
}

/// A classifier together with where and when it was loaded.
#[derive(Debug)]
pub struct LoadedModel {
    pub classifier: Arc<dyn Classifier>,
    pub source: String,
    pub loaded_at: DateTime<Utc>,
    pub metadata: Option<TrainingMetadata>,
}

/// Public summary of the loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_version: String,
    pub source: String,
    pub loaded_at: DateTime<Utc>,
    pub capabilities: Capabilities,
    pub feature_names: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TrainingMetadata>,
}

impl From<&LoadedModel> for ModelInfo {
    fn from(m: &LoadedModel) -> Self {
        Self {
            model_version: m.classifier.model_version().to_string(),
            source: m.source.clone(),
            loaded_at: m.loaded_at,
            capabilities: m.classifier.capabilities(),
            feature_names: FEATURE_NAMES.to_vec(),
            metadata: m.metadata.clone(),
        }
    }
}

pub struct PredictionEngine {
    artifact_path: PathBuf,
    model: ArcSwapOption<LoadedModel>,
    load_guard: Mutex<()>,
}

impl std::fmt::Debug for PredictionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionEngine")
            .field("artifact_path", &self.artifact_path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl PredictionEngine {
    /// Engine that lazily loads the artifact at `artifact_path`.
    pub fn new(artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            model: ArcSwapOption::empty(),
            load_guard: Mutex::new(()),
        }
    }

    /// Engine pre-seeded with an in-memory classifier.
    pub fn with_classifier(classifier: Arc<dyn Classifier>) -> Self {
        let engine = Self::new(PathBuf::new());
        engine.model.store(Some(Arc::new(LoadedModel {
            classifier,
            source: "in-memory".into(),
            loaded_at: timestamp_now(),
            metadata: None,
        })));
        engine
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn is_loaded(&self) -> bool {
        self.model.load().is_some()
    }

    pub fn info(&self) -> Option<ModelInfo> {
        self.model.load().as_deref().map(ModelInfo::from)
    }

    /// Try to load the artifact without failing. Returns whether a model is now cached.
    pub fn warm_up(&self) -> bool {
        match self.model() {
            Ok(m) => {
                info!(model_version = m.classifier.model_version(), source = %m.source, "Prediction model ready");
                true
            }
            Err(e) => {
                warn!(error = %e, "Prediction model not loaded; prediction endpoints will fail until one is trained");
                false
            }
        }
    }

    /// Cached model, loading it on first use.
    pub fn model(&self) -> Result<Arc<LoadedModel>, PredictionError> {
        if let Some(m) = self.model.load_full() {
            return Ok(m);
        }
        let _guard = self.load_guard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(m) = self.model.load_full() {
            return Ok(m);
        }
        let loaded = Arc::new(self.load_from_disk()?);
        self.model.store(Some(Arc::clone(&loaded)));
        Ok(loaded)
    }

    /// Re-read the artifact and swap it in. The previous model stays active on failure.
    pub fn reload(&self) -> Result<ModelInfo, PredictionError> {
        let _guard = self.load_guard.lock().unwrap_or_else(PoisonError::into_inner);
        let loaded = Arc::new(self.load_from_disk()?);
        let info = ModelInfo::from(loaded.as_ref());
        self.model.store(Some(loaded));
        info!(model_version = %info.model_version, "Prediction model reloaded");
        Ok(info)
    }

    fn load_from_disk(&self) -> Result<LoadedModel, PredictionError> {
        let unavailable = |reason: String| PredictionError::ModelUnavailable {
            path: self.artifact_path.clone(),
            reason,
        };
        if self.artifact_path.as_os_str().is_empty() {
            return Err(unavailable("no artifact path configured".into()));
        }
        let model = LogisticModel::load(&self.artifact_path).map_err(|e| match e {
            ArtifactError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                unavailable("artifact not found; train a model first".into())
            }
            other => unavailable(other.to_string()),
        })?;
        let metadata = Some(model.artifact().metadata.clone());
        debug!(path = %self.artifact_path.display(), model_version = %model.artifact().model_version, "Loaded model artifact");
        Ok(LoadedModel {
            classifier: Arc::new(model),
            source: self.artifact_path.display().to_string(),
            loaded_at: timestamp_now(),
            metadata,
        })
    }

    /// Score a not-yet-validated application.
    ///
    /// Encoding runs first, so malformed input is reported as a client error
    /// even when no model is available.
    pub fn predict(&self, raw: &RawApplication) -> Result<PredictionResult, PredictionError> {
        let features = FeatureEncoder::encode(raw)?;
        self.predict_features(&features)
    }

    pub fn predict_profile(&self, profile: &ApplicantProfile) -> Result<PredictionResult, PredictionError> {
        self.predict_features(&FeatureEncoder::encode_profile(profile))
    }

    /// Score a canned feature vector.
    pub fn predict_features(&self, features: &FeatureVector) -> Result<PredictionResult, PredictionError> {
        let model = self.model()?;
        let classifier = model.classifier.as_ref();
        let x = features.to_array();

        let predicted_status = classifier.predict(&x);
        let confidence_score = classifier
            .predict_probabilities(&x)
            .map_or(1.0, |[p_no, p_yes]| p_no.max(p_yes).clamp(0.0, 1.0));
        let probability_approved = match predicted_status {
            LoanStatus::Approved => confidence_score,
            LoanStatus::Rejected => 1.0 - confidence_score,
        };

        let feature_importance = if classifier.capabilities().feature_importances {
            classifier.feature_importances().map(|imp| {
                FEATURE_NAMES
                    .iter()
                    .zip(imp)
                    .map(|(name, v)| ((*name).to_string(), *v))
                    .collect()
            })
        } else {
            None
        };

        debug!(
            predicted = %predicted_status,
            confidence = confidence_score,
            model_version = classifier.model_version(),
            "Prediction computed"
        );

        Ok(PredictionResult {
            predicted_status,
            confidence_score,
            probability_approved,
            model_version: classifier.model_version().to_string(),
            feature_importance,
            features: *features,
            predicted_at: timestamp_now(),
        })
    }
}
