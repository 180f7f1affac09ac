//! Document backend (sled)
//!
//! One named tree per entity, values are JSON documents:
//! - `loan_applications`, `loan_features`: keyed by `loan_id`
//! - `loan_predictions`, `loan_analytics`: keyed by big-endian `i64` id
//!
//! There is no referential integrity. Deleting an application leaves its
//! features and predictions in place; callers remove them explicitly.

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Tree};
use tracing::{debug, info};

use super::{
    ApplicationFilter, Backend, EntityKind, EntityRecords, FeatureFilter, Page, PredictionFilter,
    RecordStore, StoreError,
};
use crate::types::{
    timestamp_now, AnalyticsSnapshot, ApplicationPatch, ApplicationStatistics, FeatureRecord,
    LoanApplication, NewPrediction, NewSnapshot, Prediction,
};

const APPLICATION: &str = EntityKind::Applications.record_name();
const FEATURES: &str = EntityKind::Features.record_name();
const PREDICTION: &str = EntityKind::Predictions.record_name();
const SNAPSHOT: &str = EntityKind::Analytics.record_name();

/// Document store over a sled database.
#[derive(Clone)]
pub struct DocumentStore {
    db: sled::Db,
    applications: Tree,
    features: Tree,
    predictions: Tree,
    analytics: Tree,
}

impl DocumentStore {
    /// Open or create the document store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(StoreError::from_sled)?;
        info!(path = %path.display(), "Document store opened");
        Self::with_db(db)
    }

    /// Throwaway store removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StoreError::from_sled)?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = |name: &str| db.open_tree(name).map_err(StoreError::from_sled);
        Ok(Self {
            applications: tree("loan_applications")?,
            features: tree("loan_features")?,
            predictions: tree("loan_predictions")?,
            analytics: tree("loan_analytics")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush_async()
            .await
            .map_err(StoreError::from_sled)?;
        Ok(())
    }

    fn tree(&self, kind: EntityKind) -> &Tree {
        match kind {
            EntityKind::Applications => &self.applications,
            EntityKind::Features => &self.features,
            EntityKind::Predictions => &self.predictions,
            EntityKind::Analytics => &self.analytics,
        }
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

fn encode<T: Serialize>(entity: &'static str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::corrupt(Backend::Document, entity, e))
}

fn decode<T: DeserializeOwned>(entity: &'static str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::corrupt(Backend::Document, entity, e))
}

fn id_key(id: i64) -> [u8; 8] {
    id.to_be_bytes()
}

fn scan<T: DeserializeOwned>(tree: &Tree, entity: &'static str) -> Result<Vec<T>, StoreError> {
    tree.iter()
        .values()
        .map(|v| decode(entity, &v.map_err(StoreError::from_sled)?))
        .collect()
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
    let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
    items.into_iter().skip(offset).take(limit).collect()
}

/// Next id after the highest stored key.
fn next_id(tree: &Tree, entity: &'static str) -> Result<i64, StoreError> {
    match tree.last().map_err(StoreError::from_sled)? {
        Some((key, _)) => {
            let bytes: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::corrupt(Backend::Document, entity, "malformed id key"))?;
            Ok(i64::from_be_bytes(bytes) + 1)
        }
        None => Ok(1),
    }
}

/// Insert `build(id)` under a fresh id, retrying if another writer takes it.
fn insert_with_next_id<T, F>(tree: &Tree, entity: &'static str, build: F) -> Result<T, StoreError>
where
    T: Serialize,
    F: Fn(i64) -> T,
{
    loop {
        let id = next_id(tree, entity)?;
        let record = build(id);
        let bytes = encode(entity, &record)?;
        match tree
            .compare_and_swap(id_key(id), None as Option<&[u8]>, Some(bytes))
            .map_err(StoreError::from_sled)?
        {
            Ok(()) => return Ok(record),
            Err(_) => debug!(entity, id, "Id taken concurrently, retrying"),
        }
    }
}

fn sort_predictions(predictions: &mut [Prediction]) {
    predictions.sort_by(|a, b| {
        a.prediction_created_at
            .cmp(&b.prediction_created_at)
            .then(a.prediction_id.cmp(&b.prediction_id))
    });
}

fn sort_snapshots(snapshots: &mut [AnalyticsSnapshot]) {
    snapshots.sort_by(|a, b| {
        b.analysis_date
            .cmp(&a.analysis_date)
            .then(b.analytics_id.cmp(&a.analytics_id))
    });
}

// ============================================================================
// RecordStore
// ============================================================================

#[async_trait]
impl RecordStore for DocumentStore {
    fn backend(&self) -> Backend {
        Backend::Document
    }

    fn cascades_deletes(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.db
            .contains_key(b"__ping")
            .map_err(StoreError::from_sled)?;
        Ok(())
    }

    async fn create_application(&self, app: &LoanApplication) -> Result<(), StoreError> {
        app.profile.validate()?;
        let bytes = encode(APPLICATION, app)?;
        self.applications
            .compare_and_swap(app.loan_id.as_bytes(), None as Option<&[u8]>, Some(bytes))
            .map_err(StoreError::from_sled)?
            .map_err(|_| StoreError::duplicate(APPLICATION, &app.loan_id))?;
        self.flush().await?;
        debug!(loan_id = %app.loan_id, "Application inserted (document)");
        Ok(())
    }

    async fn get_application(&self, loan_id: &str) -> Result<LoanApplication, StoreError> {
        let bytes = self
            .applications
            .get(loan_id.as_bytes())
            .map_err(StoreError::from_sled)?
            .ok_or_else(|| StoreError::not_found(APPLICATION, loan_id))?;
        decode(APPLICATION, &bytes)
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: Page,
    ) -> Result<Vec<LoanApplication>, StoreError> {
        // sled iterates keys in byte order, which is loan_id order
        let apps: Vec<LoanApplication> = scan(&self.applications, APPLICATION)?;
        Ok(paginate(
            apps.into_iter().filter(|a| filter.matches(a)).collect(),
            page,
        ))
    }

    async fn count_applications(&self, filter: &ApplicationFilter) -> Result<u64, StoreError> {
        let apps: Vec<LoanApplication> = scan(&self.applications, APPLICATION)?;
        Ok(apps.iter().filter(|a| filter.matches(a)).count() as u64)
    }

    async fn update_application(
        &self,
        loan_id: &str,
        patch: &ApplicationPatch,
    ) -> Result<LoanApplication, StoreError> {
        loop {
            let current = self
                .applications
                .get(loan_id.as_bytes())
                .map_err(StoreError::from_sled)?
                .ok_or_else(|| StoreError::not_found(APPLICATION, loan_id))?;
            let mut app: LoanApplication = decode(APPLICATION, &current)?;
            patch.apply(&mut app, timestamp_now())?;
            let bytes = encode(APPLICATION, &app)?;

            let swapped = self
                .applications
                .compare_and_swap(loan_id.as_bytes(), Some(&current), Some(bytes))
                .map_err(StoreError::from_sled)?;
            if swapped.is_ok() {
                self.flush().await?;
                return Ok(app);
            }
            debug!(loan_id, "Concurrent update detected, retrying patch");
        }
    }

    async fn delete_application(&self, loan_id: &str) -> Result<(), StoreError> {
        self.applications
            .remove(loan_id.as_bytes())
            .map_err(StoreError::from_sled)?
            .ok_or_else(|| StoreError::not_found(APPLICATION, loan_id))?;
        self.flush().await
    }

    async fn put_application(&self, app: &LoanApplication) -> Result<(), StoreError> {
        app.profile.validate()?;
        let bytes = encode(APPLICATION, app)?;
        self.applications
            .insert(app.loan_id.as_bytes(), bytes)
            .map_err(StoreError::from_sled)?;
        self.flush().await
    }

    async fn upsert_features(&self, record: &FeatureRecord) -> Result<(), StoreError> {
        let bytes = encode(FEATURES, record)?;
        self.features
            .insert(record.loan_id.as_bytes(), bytes)
            .map_err(StoreError::from_sled)?;
        self.flush().await
    }

    async fn get_features(&self, loan_id: &str) -> Result<FeatureRecord, StoreError> {
        let bytes = self
            .features
            .get(loan_id.as_bytes())
            .map_err(StoreError::from_sled)?
            .ok_or_else(|| StoreError::not_found(FEATURES, loan_id))?;
        decode(FEATURES, &bytes)
    }

    async fn list_features(
        &self,
        filter: &FeatureFilter,
        page: Page,
    ) -> Result<Vec<FeatureRecord>, StoreError> {
        // Keys are loan ids, so the scan is already in loan_id order
        let features: Vec<FeatureRecord> = scan::<FeatureRecord>(&self.features, FEATURES)?
            .into_iter()
            .filter(|f| filter.matches(f))
            .collect();
        Ok(paginate(features, page))
    }

    async fn delete_features(&self, loan_id: &str) -> Result<bool, StoreError> {
        let existed = self
            .features
            .remove(loan_id.as_bytes())
            .map_err(StoreError::from_sled)?
            .is_some();
        self.flush().await?;
        Ok(existed)
    }

    async fn create_prediction(&self, prediction: &NewPrediction) -> Result<Prediction, StoreError> {
        prediction.validate()?;
        let stored = insert_with_next_id(&self.predictions, PREDICTION, |id| {
            prediction.clone().with_id(id)
        })?;
        self.flush().await?;
        Ok(stored)
    }

    async fn get_prediction(&self, prediction_id: i64) -> Result<Prediction, StoreError> {
        let bytes = self
            .predictions
            .get(id_key(prediction_id))
            .map_err(StoreError::from_sled)?
            .ok_or_else(|| StoreError::not_found(PREDICTION, prediction_id))?;
        decode(PREDICTION, &bytes)
    }

    async fn list_predictions(
        &self,
        filter: &PredictionFilter,
        page: Page,
    ) -> Result<Vec<Prediction>, StoreError> {
        let mut predictions: Vec<Prediction> = scan::<Prediction>(&self.predictions, PREDICTION)?
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect();
        sort_predictions(&mut predictions);
        Ok(paginate(predictions, page))
    }

    async fn delete_prediction(&self, prediction_id: i64) -> Result<(), StoreError> {
        self.predictions
            .remove(id_key(prediction_id))
            .map_err(StoreError::from_sled)?
            .ok_or_else(|| StoreError::not_found(PREDICTION, prediction_id))?;
        self.flush().await
    }

    async fn delete_predictions_for(&self, loan_id: &str) -> Result<u64, StoreError> {
        let mut batch = Batch::default();
        let mut removed = 0u64;
        for item in self.predictions.iter() {
            let (key, value) = item.map_err(StoreError::from_sled)?;
            let prediction: Prediction = decode(PREDICTION, &value)?;
            if prediction.loan_id == loan_id {
                batch.remove(key);
                removed += 1;
            }
        }
        self.predictions
            .apply_batch(batch)
            .map_err(StoreError::from_sled)?;
        self.flush().await?;
        Ok(removed)
    }

    async fn create_snapshot(&self, snapshot: &NewSnapshot) -> Result<AnalyticsSnapshot, StoreError> {
        let created_at = timestamp_now();
        let stored = insert_with_next_id(&self.analytics, SNAPSHOT, |id| {
            snapshot.clone().with_id(id, created_at)
        })?;
        self.flush().await?;
        Ok(stored)
    }

    async fn get_snapshot(&self, analytics_id: i64) -> Result<AnalyticsSnapshot, StoreError> {
        let bytes = self
            .analytics
            .get(id_key(analytics_id))
            .map_err(StoreError::from_sled)?
            .ok_or_else(|| StoreError::not_found(SNAPSHOT, analytics_id))?;
        decode(SNAPSHOT, &bytes)
    }

    async fn latest_snapshot(&self) -> Result<Option<AnalyticsSnapshot>, StoreError> {
        let mut snapshots: Vec<AnalyticsSnapshot> = scan(&self.analytics, SNAPSHOT)?;
        sort_snapshots(&mut snapshots);
        Ok(snapshots.into_iter().next())
    }

    async fn list_snapshots(&self, page: Page) -> Result<Vec<AnalyticsSnapshot>, StoreError> {
        let mut snapshots: Vec<AnalyticsSnapshot> = scan(&self.analytics, SNAPSHOT)?;
        sort_snapshots(&mut snapshots);
        Ok(paginate(snapshots, page))
    }

    async fn statistics(&self) -> Result<ApplicationStatistics, StoreError> {
        let apps: Vec<LoanApplication> = scan(&self.applications, APPLICATION)?;
        Ok(ApplicationStatistics::from_applications(&apps))
    }

    async fn export(&self, kind: EntityKind) -> Result<EntityRecords, StoreError> {
        let all = Page::all();
        Ok(match kind {
            EntityKind::Applications => EntityRecords::Applications(scan(&self.applications, APPLICATION)?),
            EntityKind::Features => EntityRecords::Features(scan(&self.features, FEATURES)?),
            EntityKind::Predictions => EntityRecords::Predictions(
                self.list_predictions(&PredictionFilter::default(), all).await?,
            ),
            EntityKind::Analytics => EntityRecords::Analytics(self.list_snapshots(all).await?),
        })
    }

    async fn clear(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let tree = self.tree(kind);
        let removed = tree.len() as u64;
        tree.clear().map_err(StoreError::from_sled)?;
        self.flush().await?;
        debug!(entity = %kind, removed, "Cleared document tree");
        Ok(removed)
    }

    async fn insert_batch(&self, records: &EntityRecords) -> Result<u64, StoreError> {
        let mut batch = Batch::default();
        match records {
            EntityRecords::Applications(apps) => {
                for app in apps {
                    if self
                        .applications
                        .contains_key(app.loan_id.as_bytes())
                        .map_err(StoreError::from_sled)?
                    {
                        return Err(StoreError::duplicate(APPLICATION, &app.loan_id));
                    }
                    batch.insert(app.loan_id.as_bytes(), encode(APPLICATION, app)?);
                }
            }
            EntityRecords::Features(features) => {
                for record in features {
                    batch.insert(record.loan_id.as_bytes(), encode(FEATURES, record)?);
                }
            }
            EntityRecords::Predictions(predictions) => {
                for p in predictions {
                    batch.insert(id_key(p.prediction_id).to_vec(), encode(PREDICTION, p)?);
                }
            }
            EntityRecords::Analytics(snapshots) => {
                for s in snapshots {
                    batch.insert(id_key(s.analytics_id).to_vec(), encode(SNAPSHOT, s)?);
                }
            }
        }
        self.tree(records.kind())
            .apply_batch(batch)
            .map_err(StoreError::from_sled)?;
        self.flush().await?;
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ApplicantProfile, LoanStatus, NewApplication, PropertyArea, RawApplication,
    };

    fn app(id: &str, area: &str) -> LoanApplication {
        let raw = RawApplication {
            gender: "Female".into(),
            married: "Yes".into(),
            dependents: "1".into(),
            education: "Graduate".into(),
            self_employed: "No".into(),
            applicant_income: 3000.0,
            coapplicant_income: 1500.0,
            loan_amount: None,
            loan_amount_term: None,
            credit_history: Some(1),
            property_area: area.into(),
        };
        NewApplication {
            loan_id: id.into(),
            profile: ApplicantProfile::try_from(&raw).unwrap(),
            loan_status: None,
        }
        .into_application(timestamp_now())
    }

    fn prediction(loan_id: &str) -> NewPrediction {
        NewPrediction {
            loan_id: loan_id.into(),
            predicted_status: LoanStatus::Rejected,
            confidence_score: 0.7,
            probability_approved: 0.3,
            model_version: "v1".into(),
            feature_importance: None,
            prediction_created_at: timestamp_now(),
        }
    }

    #[tokio::test]
    async fn test_create_get_and_duplicate() {
        let store = DocumentStore::temporary().unwrap();
        let original = app("D1", "Rural");
        store.create_application(&original).await.unwrap();
        assert_eq!(store.get_application("D1").await.unwrap(), original);
        let err = store.create_application(&original).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_update_applies_patch() {
        let store = DocumentStore::temporary().unwrap();
        store.create_application(&app("D1", "Rural")).await.unwrap();
        let patch = ApplicationPatch {
            property_area: Some(PropertyArea::Urban),
            loan_status: Some(LoanStatus::Approved),
            ..Default::default()
        };
        let updated = store.update_application("D1", &patch).await.unwrap();
        assert_eq!(updated.profile.property_area, PropertyArea::Urban);
        assert_eq!(store.get_application("D1").await.unwrap(), updated);

        let err = store.update_application("NOPE", &patch).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_does_not_cascade() {
        let store = DocumentStore::temporary().unwrap();
        store.create_application(&app("D1", "Urban")).await.unwrap();
        store.create_prediction(&prediction("D1")).await.unwrap();
        store.delete_application("D1").await.unwrap();

        assert!(!store.cascades_deletes());
        let left = store
            .list_predictions(&PredictionFilter::for_loan("D1"), Page::all())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(store.delete_predictions_for("D1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ids_continue_after_imported_records() {
        let store = DocumentStore::temporary().unwrap();
        let imported = prediction("D1").with_id(40);
        store
            .insert_batch(&EntityRecords::Predictions(vec![imported]))
            .await
            .unwrap();
        let next = store.create_prediction(&prediction("D1")).await.unwrap();
        assert_eq!(next.prediction_id, 41);
        assert_eq!(store.get_prediction(41).await.unwrap(), next);
    }

    #[tokio::test]
    async fn test_clear_and_batch_replace() {
        let store = DocumentStore::temporary().unwrap();
        store.create_application(&app("A", "Urban")).await.unwrap();
        store.create_application(&app("B", "Rural")).await.unwrap();

        let exported = store.export(EntityKind::Applications).await.unwrap();
        assert_eq!(store.clear(EntityKind::Applications).await.unwrap(), 2);
        assert_eq!(store.insert_batch(&exported).await.unwrap(), 2);
        assert_eq!(store.export(EntityKind::Applications).await.unwrap(), exported);

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_applications, 2);
        assert_eq!(stats.property_area_distribution.get("Rural"), Some(&1));
    }
}
