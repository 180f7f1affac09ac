//! Classifier capability interface
//!
//! A classifier always predicts a label. Class probabilities and per-feature
//! importances are optional capabilities, queried explicitly through
//! [`Classifier::capabilities`] rather than discovered at call time.

use serde::Serialize;

use crate::types::{LoanStatus, NUM_FEATURES};

/// Optional capabilities a classifier may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub probabilities: bool,
    pub feature_importances: bool,
}

/// A trained, immutable model. Shared read-only across request tasks.
pub trait Classifier: Send + Sync + std::fmt::Debug {
    /// Tag stored with every prediction this model produces.
    fn model_version(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Predicted label for one feature vector.
    fn predict(&self, features: &[f64; NUM_FEATURES]) -> LoanStatus;

    /// `[p(rejected), p(approved)]`, or `None` without the capability.
    fn predict_probabilities(&self, _features: &[f64; NUM_FEATURES]) -> Option<[f64; 2]> {
        None
    }

    /// One importance per feature in model input order, or `None`.
    fn feature_importances(&self) -> Option<&[f64]> {
        None
    }
}
