//! Offline trainer for the logistic-regression artifact
//!
//! Rows are encoded with the same [`FeatureEncoder`] the engine uses at
//! inference, standardized with statistics from the training split only, and
//! fitted with L2-regularized batch gradient descent. The shuffle is seeded,
//! so the same data and configuration always produce the same artifact
//! weights.

use std::path::Path;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use super::artifact::{
    save_artifact, sigmoid, ArtifactError, ModelArtifact, StandardScaler, TrainingMetadata,
    ARTIFACT_FORMAT_VERSION,
};
use super::encoder::FeatureEncoder;
use crate::config::ModelConfig;
use crate::types::{LoanApplication, LoanStatus, FEATURE_NAMES, NUM_FEATURES};

/// Fewest labelled rows worth fitting.
pub const MIN_TRAINING_ROWS: usize = 4;

/// Stop once the loss improves by less than this between iterations.
const CONVERGENCE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("need at least {required} labelled applications, found {found}")]
    NotEnoughData { found: usize, required: usize },

    #[error("training split contains only {0} labels; both outcomes are required")]
    SingleClass(LoanStatus),

    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub seed: u64,
    pub test_fraction: f64,
    pub max_iterations: usize,
    pub learning_rate: f64,
    pub l2_penalty: f64,
    /// Defaults to `logreg-<UTC timestamp>`
    pub model_version: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

impl From<&ModelConfig> for TrainingConfig {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            seed: cfg.training_seed,
            test_fraction: cfg.test_fraction,
            max_iterations: cfg.max_iterations,
            learning_rate: cfg.learning_rate,
            l2_penalty: cfg.l2_penalty,
            model_version: None,
        }
    }
}

/// Summary of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub model_version: String,
    pub labelled_rows: usize,
    pub training_rows: usize,
    pub test_rows: usize,
    pub test_accuracy: Option<f64>,
    pub final_loss: f64,
    pub iterations: usize,
    #[serde(skip)]
    pub artifact: ModelArtifact,
}

/// Fit a model on every labelled application in `apps`.
pub fn train(apps: &[LoanApplication], cfg: &TrainingConfig) -> Result<TrainingReport, TrainingError> {
    if !(cfg.test_fraction >= 0.0 && cfg.test_fraction < 1.0) {
        return Err(TrainingError::InvalidConfig(format!(
            "test_fraction {} outside [0, 1)",
            cfg.test_fraction
        )));
    }
    if !(cfg.learning_rate > 0.0) || cfg.l2_penalty < 0.0 {
        return Err(TrainingError::InvalidConfig(
            "learning_rate must be > 0 and l2_penalty >= 0".into(),
        ));
    }

    let mut rows: Vec<([f64; NUM_FEATURES], f64)> = apps
        .iter()
        .filter_map(|app| {
            let label = match app.loan_status? {
                LoanStatus::Approved => 1.0,
                LoanStatus::Rejected => 0.0,
            };
            Some((FeatureEncoder::encode_profile(&app.profile).to_array(), label))
        })
        .collect();
    let labelled_rows = rows.len();
    if labelled_rows < MIN_TRAINING_ROWS {
        return Err(TrainingError::NotEnoughData {
            found: labelled_rows,
            required: MIN_TRAINING_ROWS,
        });
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    rows.shuffle(&mut rng);

    let test_rows = ((labelled_rows as f64) * cfg.test_fraction).floor() as usize;
    let test_rows = test_rows.min(labelled_rows - MIN_TRAINING_ROWS / 2);
    let (test, train_set) = rows.split_at(test_rows);

    let positives = train_set.iter().filter(|(_, y)| *y > 0.5).count();
    if positives == 0 {
        return Err(TrainingError::SingleClass(LoanStatus::Rejected));
    }
    if positives == train_set.len() {
        return Err(TrainingError::SingleClass(LoanStatus::Approved));
    }

    let scaler = fit_scaler(train_set);
    let scaled: Vec<([f64; NUM_FEATURES], f64)> = train_set
        .iter()
        .map(|(x, y)| (standardize(x, &scaler), *y))
        .collect();

    let (weights, intercept, final_loss, iterations) = gradient_descent(&scaled, cfg);

    let test_accuracy = if test.is_empty() {
        None
    } else {
        let correct = test
            .iter()
            .filter(|(x, y)| {
                let p = sigmoid(dot(&weights, &standardize(x, &scaler)) + intercept);
                (p >= 0.5) == (*y > 0.5)
            })
            .count();
        Some(correct as f64 / test.len() as f64)
    };

    let model_version = cfg
        .model_version
        .clone()
        .unwrap_or_else(|| format!("logreg-{}", Utc::now().format("%Y%m%d%H%M%S")));

    let artifact = ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        model_version: model_version.clone(),
        feature_names: FEATURE_NAMES.iter().map(|s| (*s).to_string()).collect(),
        weights: weights.to_vec(),
        intercept,
        scaler: Some(StandardScaler {
            mean: scaler.0.to_vec(),
            std: scaler.1.to_vec(),
        }),
        feature_importances: Some(importances(&weights)),
        metadata: TrainingMetadata {
            trained_at: Some(Utc::now()),
            training_rows: train_set.len(),
            test_rows: test.len(),
            test_accuracy,
            seed: cfg.seed,
            iterations,
            final_loss: Some(final_loss),
        },
    };

    info!(
        model_version = %model_version,
        training_rows = train_set.len(),
        test_rows = test.len(),
        accuracy = ?test_accuracy,
        iterations,
        "Model trained"
    );

    Ok(TrainingReport {
        model_version,
        labelled_rows,
        training_rows: train_set.len(),
        test_rows: test.len(),
        test_accuracy,
        final_loss,
        iterations,
        artifact,
    })
}

/// Train and atomically write the artifact to `path`.
pub fn train_and_save(
    apps: &[LoanApplication],
    cfg: &TrainingConfig,
    path: &Path,
) -> Result<TrainingReport, TrainingError> {
    let report = train(apps, cfg)?;
    save_artifact(&report.artifact, path)?;
    info!(path = %path.display(), "Model artifact written");
    Ok(report)
}

type Scaler = ([f64; NUM_FEATURES], [f64; NUM_FEATURES]);

fn fit_scaler(rows: &[([f64; NUM_FEATURES], f64)]) -> Scaler {
    let n = rows.len() as f64;
    let mut mean = [0.0; NUM_FEATURES];
    for (x, _) in rows {
        for i in 0..NUM_FEATURES {
            mean[i] += x[i] / n;
        }
    }
    let mut std = [0.0; NUM_FEATURES];
    for (x, _) in rows {
        for i in 0..NUM_FEATURES {
            std[i] += (x[i] - mean[i]).powi(2) / n;
        }
    }
    for s in &mut std {
        *s = s.sqrt();
        // Constant column: leave it centred at zero
        if *s < 1e-8 {
            *s = 1.0;
        }
    }
    (mean, std)
}

fn standardize(x: &[f64; NUM_FEATURES], (mean, std): &Scaler) -> [f64; NUM_FEATURES] {
    std::array::from_fn(|i| (x[i] - mean[i]) / std[i])
}

fn dot(w: &[f64; NUM_FEATURES], x: &[f64; NUM_FEATURES]) -> f64 {
    w.iter().zip(x).map(|(a, b)| a * b).sum()
}

fn log_loss(rows: &[([f64; NUM_FEATURES], f64)], w: &[f64; NUM_FEATURES], b: f64, l2: f64) -> f64 {
    let n = rows.len() as f64;
    let data: f64 = rows
        .iter()
        .map(|(x, y)| {
            let p = sigmoid(dot(w, x) + b).clamp(1e-12, 1.0 - 1e-12);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum::<f64>()
        / n;
    data + 0.5 * l2 * w.iter().map(|v| v * v).sum::<f64>()
}

/// Batch gradient descent. Returns `(weights, intercept, loss, iterations)`.
fn gradient_descent(
    rows: &[([f64; NUM_FEATURES], f64)],
    cfg: &TrainingConfig,
) -> ([f64; NUM_FEATURES], f64, f64, usize) {
    let n = rows.len() as f64;
    let mut w = [0.0; NUM_FEATURES];
    let mut b = 0.0;
    let mut loss = log_loss(rows, &w, b, cfg.l2_penalty);
    let mut iterations = 0;

    for iter in 1..=cfg.max_iterations {
        let mut grad_w = [0.0; NUM_FEATURES];
        let mut grad_b = 0.0;
        for (x, y) in rows {
            let err = sigmoid(dot(&w, x) + b) - y;
            for i in 0..NUM_FEATURES {
                grad_w[i] += err * x[i] / n;
            }
            grad_b += err / n;
        }
        for i in 0..NUM_FEATURES {
            w[i] -= cfg.learning_rate * (grad_w[i] + cfg.l2_penalty * w[i]);
        }
        b -= cfg.learning_rate * grad_b;

        iterations = iter;
        let next = log_loss(rows, &w, b, cfg.l2_penalty);
        if (loss - next).abs() < CONVERGENCE_TOLERANCE {
            loss = next;
            debug!(iterations, loss, "Gradient descent converged");
            break;
        }
        loss = next;
    }
    (w, b, loss, iterations)
}

/// Normalized absolute standardized coefficients.
fn importances(w: &[f64; NUM_FEATURES]) -> Vec<f64> {
    let total: f64 = w.iter().map(|v| v.abs()).sum();
    if total <= 0.0 {
        return vec![0.0; NUM_FEATURES];
    }
    w.iter().map(|v| v.abs() / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::{Classifier, LogisticModel};
    use crate::types::{ApplicantProfile, NewApplication, RawApplication};

    /// Approved exactly when credit history is 1; incomes vary to add noise columns.
    fn dataset(n: usize) -> Vec<LoanApplication> {
        (0..n)
            .map(|i| {
                let credit = (i % 3 != 0) as i64;
                let raw = RawApplication {
                    gender: if i % 2 == 0 { "Male" } else { "Female" }.into(),
                    married: "Yes".into(),
                    dependents: "0".into(),
                    education: "Graduate".into(),
                    self_employed: "No".into(),
                    applicant_income: 2000.0 + (i * 137 % 5000) as f64,
                    coapplicant_income: (i * 53 % 1500) as f64,
                    loan_amount: Some(100.0 + (i % 7) as f64 * 10.0),
                    loan_amount_term: Some(360),
                    credit_history: Some(credit),
                    property_area: "Urban".into(),
                };
                NewApplication {
                    loan_id: format!("T{i:03}"),
                    profile: ApplicantProfile::try_from(&raw).unwrap(),
                    loan_status: Some(if credit == 1 {
                        LoanStatus::Approved
                    } else {
                        LoanStatus::Rejected
                    }),
                }
                .into_application(Utc::now())
            })
            .collect()
    }

    fn cfg() -> TrainingConfig {
        TrainingConfig {
            model_version: Some("logreg-test".into()),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_learns_separable_signal() {
        let report = train(&dataset(60), &cfg()).unwrap();
        assert_eq!(report.labelled_rows, 60);
        assert_eq!(report.test_rows, 15);
        assert_eq!(report.training_rows, 45);
        assert!(report.test_accuracy.unwrap() >= 0.9);

        let imp = report.artifact.feature_importances.as_ref().unwrap();
        let credit_idx = FEATURE_NAMES.iter().position(|n| *n == "credit_history").unwrap();
        let max = imp.iter().cloned().fold(f64::MIN, f64::max);
        assert_eq!(imp[credit_idx], max);
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = train(&dataset(40), &cfg()).unwrap();
        let b = train(&dataset(40), &cfg()).unwrap();
        assert_eq!(a.artifact.weights, b.artifact.weights);
        assert_eq!(a.artifact.intercept, b.artifact.intercept);
    }

    #[test]
    fn test_artifact_loads_into_engine_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        train_and_save(&dataset(40), &cfg(), &path).unwrap();
        let model = LogisticModel::load(&path).unwrap();
        assert_eq!(model.model_version(), "logreg-test");
        assert!(model.capabilities().probabilities);
    }

    #[test]
    fn test_rejects_unlabelled_and_single_class() {
        let mut apps = dataset(10);
        for app in &mut apps {
            app.loan_status = None;
        }
        assert!(matches!(
            train(&apps, &cfg()),
            Err(TrainingError::NotEnoughData { found: 0, .. })
        ));

        let mut apps = dataset(10);
        for app in &mut apps {
            app.loan_status = Some(LoanStatus::Approved);
        }
        assert!(matches!(
            train(&apps, &cfg()),
            Err(TrainingError::SingleClass(LoanStatus::Approved))
        ));
    }

    #[test]
    fn test_invalid_config() {
        let bad = TrainingConfig {
            test_fraction: 1.0,
            ..cfg()
        };
        assert!(matches!(train(&dataset(10), &bad), Err(TrainingError::InvalidConfig(_))));
    }
}
