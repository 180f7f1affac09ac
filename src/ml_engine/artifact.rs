//! Logistic-regression model artifact
//!
//! Serialized as JSON. Loading validates that the artifact was trained on
//! exactly the encoder's feature layout; an artifact with a different
//! `feature_names` list is rejected as incompatible instead of producing
//! silently wrong predictions.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classifier::{Capabilities, Classifier};
use crate::types::{LoanStatus, FEATURE_NAMES, NUM_FEATURES};

/// Current artifact layout version.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Lower bound on a scaler standard deviation.
const MIN_STD: f64 = 1e-8;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("cannot access model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed model artifact {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("incompatible model artifact: {0}")]
    Incompatible(String),
}

/// Per-feature standardization learned at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

/// Provenance recorded by the trainer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingMetadata {
    pub trained_at: Option<DateTime<Utc>>,
    pub training_rows: usize,
    pub test_rows: usize,
    pub test_accuracy: Option<f64>,
    pub seed: u64,
    pub iterations: usize,
    pub final_loss: Option<f64>,
}

/// On-disk shape of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub model_version: String,
    pub feature_names: Vec<String>,
    pub weights: Vec<f64>,
    pub intercept: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaler: Option<StandardScaler>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_importances: Option<Vec<f64>>,
    #[serde(default)]
    pub metadata: TrainingMetadata,
}

/// Save an artifact atomically (write temp file, then rename).
pub fn save_artifact(artifact: &ModelArtifact, path: &Path) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(artifact).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json).map_err(io_err)?;
    std::fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

pub fn load_artifact(path: &Path) -> Result<ModelArtifact, ArtifactError> {
    let data = std::fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Validated logistic-regression classifier.
#[derive(Debug, Clone)]
pub struct LogisticModel {
    version: String,
    weights: [f64; NUM_FEATURES],
    intercept: f64,
    scaler: Option<([f64; NUM_FEATURES], [f64; NUM_FEATURES])>,
    importances: Option<Vec<f64>>,
    artifact: ModelArtifact,
}

impl LogisticModel {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ArtifactError> {
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ArtifactError::Incompatible(format!(
                "format_version {} (expected {ARTIFACT_FORMAT_VERSION})",
                artifact.format_version
            )));
        }
        if artifact.feature_names.iter().map(String::as_str).ne(FEATURE_NAMES) {
            return Err(ArtifactError::Incompatible(format!(
                "feature_names {:?} do not match encoder layout {:?}",
                artifact.feature_names, FEATURE_NAMES
            )));
        }
        if artifact.model_version.trim().is_empty() {
            return Err(ArtifactError::Incompatible("empty model_version".into()));
        }

        let weights = fixed(&artifact.weights, "weights")?;
        if !artifact.intercept.is_finite() {
            return Err(ArtifactError::Incompatible("non-finite intercept".into()));
        }
        let scaler = match &artifact.scaler {
            Some(s) => {
                let mean = fixed(&s.mean, "scaler.mean")?;
                let mut std = fixed(&s.std, "scaler.std")?;
                for v in &mut std {
                    *v = v.abs().max(MIN_STD);
                }
                Some((mean, std))
            }
            None => None,
        };
        if let Some(imp) = &artifact.feature_importances {
            fixed(imp, "feature_importances")?;
        }

        Ok(Self {
            version: artifact.model_version.clone(),
            weights,
            intercept: artifact.intercept,
            scaler,
            importances: artifact.feature_importances.clone(),
            artifact,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        Self::from_artifact(load_artifact(path)?)
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    /// Probability of the approved class.
    pub fn probability_approved(&self, features: &[f64; NUM_FEATURES]) -> f64 {
        let mut z = self.intercept;
        for i in 0..NUM_FEATURES {
            let x = match &self.scaler {
                Some((mean, std)) => (features[i] - mean[i]) / std[i],
                None => features[i],
            };
            z += self.weights[i] * x;
        }
        sigmoid(z)
    }
}

impl Classifier for LogisticModel {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            probabilities: true,
            feature_importances: self.importances.is_some(),
        }
    }

    fn predict(&self, features: &[f64; NUM_FEATURES]) -> LoanStatus {
        if self.probability_approved(features) >= 0.5 {
            LoanStatus::Approved
        } else {
            LoanStatus::Rejected
        }
    }

    fn predict_probabilities(&self, features: &[f64; NUM_FEATURES]) -> Option<[f64; 2]> {
        let p = self.probability_approved(features);
        Some([1.0 - p, p])
    }

    fn feature_importances(&self) -> Option<&[f64]> {
        self.importances.as_deref()
    }
}

/// Numerically stable logistic function.
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn fixed(values: &[f64], name: &str) -> Result<[f64; NUM_FEATURES], ArtifactError> {
    let arr: [f64; NUM_FEATURES] = values.try_into().map_err(|_| {
        ArtifactError::Incompatible(format!(
            "{name} has {} entries, expected {NUM_FEATURES}",
            values.len()
        ))
    })?;
    if arr.iter().any(|v| !v.is_finite()) {
        return Err(ArtifactError::Incompatible(format!("{name} contains non-finite values")));
    }
    Ok(arr)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Artifact that approves whenever credit_history is 1.
    pub(crate) fn credit_history_artifact() -> ModelArtifact {
        let mut weights = vec![0.0; NUM_FEATURES];
        weights[4] = 4.0;
        let mut importances = vec![0.0; NUM_FEATURES];
        importances[4] = 1.0;
        ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            model_version: "logreg-test".into(),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            weights,
            intercept: -2.0,
            scaler: None,
            feature_importances: Some(importances),
            metadata: TrainingMetadata::default(),
        }
    }

    #[test]
    fn test_sigmoid_bounds() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(800.0) <= 1.0);
        assert!(sigmoid(-800.0) >= 0.0);
    }

    #[test]
    fn test_predicts_from_weights() {
        let model = LogisticModel::from_artifact(credit_history_artifact()).unwrap();
        let mut x = [0.0; NUM_FEATURES];
        assert_eq!(model.predict(&x), LoanStatus::Rejected);
        x[4] = 1.0;
        assert_eq!(model.predict(&x), LoanStatus::Approved);
        let [p_no, p_yes] = model.predict_probabilities(&x).unwrap();
        assert!((p_no + p_yes - 1.0).abs() < 1e-12);
        assert!((p_yes - sigmoid(2.0)).abs() < 1e-12);
        assert!(model.capabilities().feature_importances);
    }

    #[test]
    fn test_scaler_applied() {
        let mut artifact = credit_history_artifact();
        artifact.scaler = Some(StandardScaler {
            mean: vec![0.5; NUM_FEATURES],
            std: vec![0.5; NUM_FEATURES],
        });
        let model = LogisticModel::from_artifact(artifact).unwrap();
        let mut x = [0.0; NUM_FEATURES];
        x[4] = 1.0;
        // (1 - 0.5) / 0.5 = 1 → z = 4 - 2
        assert!((model.probability_approved(&x) - sigmoid(2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_mismatched_feature_names() {
        let mut artifact = credit_history_artifact();
        artifact.feature_names.swap(0, 1);
        assert!(matches!(
            LogisticModel::from_artifact(artifact),
            Err(ArtifactError::Incompatible(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_weight_count() {
        let mut artifact = credit_history_artifact();
        artifact.weights.pop();
        let err = LogisticModel::from_artifact(artifact).unwrap_err();
        assert!(err.to_string().contains("weights"));
    }

    #[test]
    fn test_save_and_load_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("model.json");
        save_artifact(&credit_history_artifact(), &path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let model = LogisticModel::load(&path).unwrap();
        assert_eq!(model.model_version(), "logreg-test");
        assert_eq!(model.artifact(), &credit_history_artifact());
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(LogisticModel::load(&missing), Err(ArtifactError::Io { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{not json").unwrap();
        assert!(matches!(LogisticModel::load(&bad), Err(ArtifactError::Parse { .. })));
    }
}
