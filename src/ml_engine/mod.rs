//! ML Engine for loan approval prediction
//!
//! ## Architecture
//! - `encoder`: deterministic application → feature vector encoding
//! - `classifier`: capability-checked classifier interface
//! - `artifact`: JSON logistic-regression artifact (load, validate, atomic save)
//! - `engine`: load-once model cache, inference, confidence and importances
//! - `training`: offline trainer producing the artifact

pub mod artifact;
pub mod classifier;
pub mod encoder;
pub mod engine;
pub mod training;

pub use artifact::{ArtifactError, LogisticModel, ModelArtifact, TrainingMetadata};
pub use classifier::{Capabilities, Classifier};
pub use encoder::FeatureEncoder;
pub use engine::{LoadedModel, ModelInfo, PredictionEngine, PredictionError};
pub use training::{train, train_and_save, TrainingConfig, TrainingError, TrainingReport};
