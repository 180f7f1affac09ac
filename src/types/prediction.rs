//! Prediction results and persisted prediction history

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::application::{validate_loan_id, LoanStatus};
use super::features::FeatureVector;
use super::validation::{unit_interval, ValidationError};

/// Output of one inference run, before (optional) persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_status: LoanStatus,
    /// Highest class probability, in [0, 1]
    pub confidence_score: f64,
    /// Probability of the approved class, in [0, 1]
    pub probability_approved: f64,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_importance: Option<BTreeMap<String, f64>>,
    pub features: FeatureVector,
    pub predicted_at: DateTime<Utc>,
}

impl PredictionResult {
    /// Features ranked by importance, highest first. Empty without importances.
    pub fn top_features(&self, n: usize) -> Vec<(String, f64)> {
        let Some(importance) = &self.feature_importance else {
            return Vec::new();
        };
        let mut ranked: Vec<(String, f64)> =
            importance.iter().map(|(k, v)| (k.clone(), *v)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn into_new_prediction(self, loan_id: impl Into<String>) -> NewPrediction {
        NewPrediction {
            loan_id: loan_id.into(),
            predicted_status: self.predicted_status,
            confidence_score: self.confidence_score,
            probability_approved: self.probability_approved,
            model_version: self.model_version,
            feature_importance: self.feature_importance,
            prediction_created_at: self.predicted_at,
        }
    }
}

/// A prediction about to be stored; the store assigns `prediction_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrediction {
    pub loan_id: String,
    pub predicted_status: LoanStatus,
    pub confidence_score: f64,
    pub probability_approved: f64,
    pub model_version: String,
    #[serde(default)]
    pub feature_importance: Option<BTreeMap<String, f64>>,
    pub prediction_created_at: DateTime<Utc>,
}

impl NewPrediction {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_loan_id(&self.loan_id)?;
        unit_interval("confidence_score", self.confidence_score)?;
        unit_interval("probability_approved", self.probability_approved)?;
        if self.model_version.trim().is_empty() {
            return Err(ValidationError::new("model_version", "must not be empty"));
        }
        Ok(())
    }

    pub fn with_id(self, prediction_id: i64) -> Prediction {
        Prediction {
            prediction_id,
            loan_id: self.loan_id,
            predicted_status: self.predicted_status,
            confidence_score: self.confidence_score,
            probability_approved: self.probability_approved,
            model_version: self.model_version,
            feature_importance: self.feature_importance,
            prediction_created_at: self.prediction_created_at,
        }
    }
}

/// A stored prediction. Several may exist per application, ordered by
/// `prediction_created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction_id: i64,
    pub loan_id: String,
    pub predicted_status: LoanStatus,
    pub confidence_score: f64,
    pub probability_approved: f64,
    pub model_version: String,
    #[serde(default)]
    pub feature_importance: Option<BTreeMap<String, f64>>,
    pub prediction_created_at: DateTime<Utc>,
}

impl Prediction {
    /// Backend-independent identity: `(loan_id, model_version, created_at)`.
    ///
    /// Generated ids differ between backends, so reconciliation checks use this.
    pub fn identity_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.loan_id,
            self.model_version,
            super::format_timestamp(&self.prediction_created_at)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_importance() -> PredictionResult {
        let mut importance = BTreeMap::new();
        importance.insert("credit_history".to_string(), 0.6);
        importance.insert("total_income".to_string(), 0.3);
        importance.insert("loan_amount".to_string(), 0.1);
        PredictionResult {
            predicted_status: LoanStatus::Approved,
            confidence_score: 0.8,
            probability_approved: 0.8,
            model_version: "logreg-test".into(),
            feature_importance: Some(importance),
            features: FeatureVector::default(),
            predicted_at: Utc::now(),
        }
    }

    #[test]
    fn test_top_features_ranked() {
        let top = result_with_importance().top_features(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "credit_history");
        assert_eq!(top[1].0, "total_income");
    }

    #[test]
    fn test_new_prediction_validation() {
        let mut p = result_with_importance().into_new_prediction("L1");
        assert!(p.validate().is_ok());
        p.confidence_score = 1.5;
        assert_eq!(p.validate().unwrap_err().field, "confidence_score");
    }

    #[test]
    fn test_identity_key_ignores_generated_id() {
        let new = result_with_importance().into_new_prediction("L1");
        let a = new.clone().with_id(1);
        let b = new.with_id(99);
        assert_eq!(a.identity_key(), b.identity_key());
        assert!(a.identity_key().starts_with("L1|logreg-test|"));
    }
}
