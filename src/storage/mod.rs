//! Record storage over two heterogeneous backends
//!
//! [`RecordStore`] is the single persistence interface for applications,
//! feature vectors, predictions and analytics snapshots:
//! - `RelationalStore`: SQLite via sqlx, with foreign-key cascades
//! - `DocumentStore`: sled trees of JSON documents, no referential integrity
//!
//! Writes to one backend are never atomic with writes to the other. Callers
//! choose write-through or write-one-then-reconcile explicitly (see
//! `config::WriteMode` and the `sync` module).

mod document;
mod error;
mod relational;

pub use document::DocumentStore;
pub use error::StoreError;
pub use relational::RelationalStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AnalyticsSnapshot, ApplicationPatch, ApplicationStatistics, Education, FeatureRecord, Gender,
    LoanApplication, LoanStatus, NewPrediction, NewSnapshot, Prediction, PropertyArea,
    ValidationError,
};

// ============================================================================
// Backends and entity kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Relational,
    Document,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Backend::Relational => "relational",
            Backend::Document => "document",
        })
    }
}

/// A reconcilable entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Applications,
    Features,
    Predictions,
    Analytics,
}

impl EntityKind {
    /// Every kind, parents before dependents.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Applications,
        EntityKind::Features,
        EntityKind::Predictions,
        EntityKind::Analytics,
    ];

    /// Kinds derived from applications.
    pub const DERIVED: [EntityKind; 3] = [
        EntityKind::Features,
        EntityKind::Predictions,
        EntityKind::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Applications => "applications",
            EntityKind::Features => "features",
            EntityKind::Predictions => "predictions",
            EntityKind::Analytics => "analytics",
        }
    }

    /// Singular name used in error messages.
    pub const fn record_name(&self) -> &'static str {
        match self {
            EntityKind::Applications => "loan_application",
            EntityKind::Features => "loan_features",
            EntityKind::Predictions => "loan_prediction",
            EntityKind::Analytics => "analytics_snapshot",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                ValidationError::out_of_domain(
                    "entity",
                    s,
                    &Self::ALL.map(|k| k.as_str()),
                )
            })
    }
}

/// All records of one kind, as exported for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRecords {
    Applications(Vec<LoanApplication>),
    Features(Vec<FeatureRecord>),
    Predictions(Vec<Prediction>),
    Analytics(Vec<AnalyticsSnapshot>),
}

impl EntityRecords {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecords::Applications(_) => EntityKind::Applications,
            EntityRecords::Features(_) => EntityKind::Features,
            EntityRecords::Predictions(_) => EntityKind::Predictions,
            EntityRecords::Analytics(_) => EntityKind::Analytics,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EntityRecords::Applications(v) => v.len(),
            EntityRecords::Features(v) => v.len(),
            EntityRecords::Predictions(v) => v.len(),
            EntityRecords::Analytics(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend-independent identity of every record.
    ///
    /// Predictions and snapshots use natural keys because generated ids are
    /// not comparable across backends.
    pub fn identity_keys(&self) -> BTreeSet<String> {
        match self {
            EntityRecords::Applications(v) => v.iter().map(|a| a.loan_id.clone()).collect(),
            EntityRecords::Features(v) => v.iter().map(|f| f.loan_id.clone()).collect(),
            EntityRecords::Predictions(v) => v.iter().map(Prediction::identity_key).collect(),
            EntityRecords::Analytics(v) => v.iter().map(AnalyticsSnapshot::identity_key).collect(),
        }
    }
}

// ============================================================================
// Query parameters
// ============================================================================

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Everything.
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: i64::MAX as u64,
        }
    }
}

/// Application search criteria. `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApplicationFilter {
    pub gender: Option<Gender>,
    pub education: Option<Education>,
    pub property_area: Option<PropertyArea>,
    pub loan_status: Option<LoanStatus>,
    pub min_income: Option<f64>,
    pub max_income: Option<f64>,
}

impl ApplicationFilter {
    pub fn matches(&self, app: &LoanApplication) -> bool {
        let p = &app.profile;
        self.gender.map_or(true, |g| p.gender == g)
            && self.education.map_or(true, |e| p.education == e)
            && self.property_area.map_or(true, |a| p.property_area == a)
            && self.loan_status.map_or(true, |s| app.loan_status == Some(s))
            && self.min_income.map_or(true, |m| p.applicant_income >= m)
            && self.max_income.map_or(true, |m| p.applicant_income <= m)
    }
}

/// Prediction search criteria.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PredictionFilter {
    pub loan_id: Option<String>,
    pub model_version: Option<String>,
}

impl PredictionFilter {
    pub fn for_loan(loan_id: impl Into<String>) -> Self {
        Self {
            loan_id: Some(loan_id.into()),
            model_version: None,
        }
    }

    pub fn matches(&self, p: &Prediction) -> bool {
        self.loan_id.as_deref().map_or(true, |id| p.loan_id == id)
            && self
                .model_version
                .as_deref()
                .map_or(true, |v| p.model_version == v)
    }
}

/// Feature listing criteria.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeatureFilter {
    /// Only vectors derived at or after this instant
    pub derived_since: Option<DateTime<Utc>>,
}

impl FeatureFilter {
    pub fn matches(&self, record: &FeatureRecord) -> bool {
        self.derived_since.map_or(true, |t| record.derived_at >= t)
    }
}

// ============================================================================
// RecordStore
// ============================================================================

/// Uniform persistence operations over either backend.
///
/// Applications and features are listed in `loan_id` order, predictions in
/// `(prediction_created_at, prediction_id)` order, snapshots newest first.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend(&self) -> Backend;

    /// Whether deleting an application removes its features and predictions.
    fn cascades_deletes(&self) -> bool;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    // --- applications ---

    /// Fails with `DuplicateKey` if `loan_id` exists.
    async fn create_application(&self, app: &LoanApplication) -> Result<(), StoreError>;

    async fn get_application(&self, loan_id: &str) -> Result<LoanApplication, StoreError>;

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: Page,
    ) -> Result<Vec<LoanApplication>, StoreError>;

    async fn count_applications(&self, filter: &ApplicationFilter) -> Result<u64, StoreError>;

    /// Apply only the supplied fields and return the updated record.
    async fn update_application(
        &self,
        loan_id: &str,
        patch: &ApplicationPatch,
    ) -> Result<LoanApplication, StoreError>;

    async fn delete_application(&self, loan_id: &str) -> Result<(), StoreError>;

    /// Insert or replace an application verbatim, timestamps included.
    ///
    /// Used to mirror a record already committed elsewhere. Replacing does
    /// not touch dependent features or predictions.
    async fn put_application(&self, app: &LoanApplication) -> Result<(), StoreError>;

    // --- features ---

    /// Insert or replace the feature vector of one application.
    async fn upsert_features(&self, record: &FeatureRecord) -> Result<(), StoreError>;

    async fn get_features(&self, loan_id: &str) -> Result<FeatureRecord, StoreError>;

    async fn list_features(
        &self,
        filter: &FeatureFilter,
        page: Page,
    ) -> Result<Vec<FeatureRecord>, StoreError>;

    /// Returns whether a record existed.
    async fn delete_features(&self, loan_id: &str) -> Result<bool, StoreError>;

    // --- predictions ---

    /// Store a prediction and return it with its generated id.
    async fn create_prediction(&self, prediction: &NewPrediction) -> Result<Prediction, StoreError>;

    async fn get_prediction(&self, prediction_id: i64) -> Result<Prediction, StoreError>;

    async fn list_predictions(
        &self,
        filter: &PredictionFilter,
        page: Page,
    ) -> Result<Vec<Prediction>, StoreError>;

    /// Fails with `NotFound` if no prediction has this id.
    async fn delete_prediction(&self, prediction_id: i64) -> Result<(), StoreError>;

    /// Returns the number of predictions removed.
    async fn delete_predictions_for(&self, loan_id: &str) -> Result<u64, StoreError>;

    // --- analytics ---

    async fn create_snapshot(&self, snapshot: &NewSnapshot) -> Result<AnalyticsSnapshot, StoreError>;

    async fn get_snapshot(&self, analytics_id: i64) -> Result<AnalyticsSnapshot, StoreError>;

    async fn latest_snapshot(&self) -> Result<Option<AnalyticsSnapshot>, StoreError>;

    async fn list_snapshots(&self, page: Page) -> Result<Vec<AnalyticsSnapshot>, StoreError>;

    /// Ad-hoc aggregate over all applications.
    async fn statistics(&self) -> Result<ApplicationStatistics, StoreError>;

    // --- bulk (reconciliation) ---

    async fn export(&self, kind: EntityKind) -> Result<EntityRecords, StoreError>;

    /// Delete every record of `kind`. Returns the number removed.
    async fn clear(&self, kind: EntityKind) -> Result<u64, StoreError>;

    /// Insert records verbatim, preserving ids and timestamps.
    async fn insert_batch(&self, records: &EntityRecords) -> Result<u64, StoreError>;
}
