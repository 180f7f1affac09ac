//! Loan Pipeline: loan application features, approval prediction and dual-store sync
//!
//! ## Architecture
//!
//! - **Feature encoder**: deterministic application → fixed-order feature vector
//! - **Prediction engine**: cached logistic-regression artifact, confidence and importances
//! - **Record store**: one persistence interface over SQLite (sqlx) and sled
//! - **Sync reconciler**: full-resync mirroring between the two stores
//! - **API**: axum routes over the [`service::LoanService`] workflows

pub mod api;
pub mod config;
pub mod ml_engine;
pub mod service;
pub mod storage;
pub mod sync;
pub mod types;

// Re-export configuration
pub use config::AppConfig;

// Re-export commonly used types
pub use types::{
    AnalyticsSnapshot, ApplicantProfile, ApplicationPatch, FeatureVector, LoanApplication,
    LoanStatus, Prediction, PredictionResult, RawApplication, ValidationError,
};

// Re-export the pipeline components
pub use ml_engine::{FeatureEncoder, PredictionEngine, PredictionError};
pub use service::{LoanService, ServiceError};
pub use storage::{DocumentStore, EntityKind, RecordStore, RelationalStore, StoreError};
pub use sync::{SyncError, SyncReconciler};
