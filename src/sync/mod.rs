//! Cross-store synchronization
//!
//! A [`SyncReconciler`] mirrors one backend into the other by full resync:
//! export everything of one entity kind from the source, clear the
//! destination, bulk-insert. There is no diffing or conflict detection; the
//! destination ends up equal to the source as of the export.
//!
//! Failure between clear and insert leaves the destination empty or partly
//! populated. A failed run must be retried from the start.
//!
//! Clearing applications in a destination that cascades deletes also drops
//! features and predictions, so those kinds are restored in the same run.
//!
//! - `derive`: rebuild features, predictions and a snapshot from applications
//! - `scheduler`: optional periodic reconciliation

pub mod derive;
mod scheduler;

pub use derive::{rebuild_derived, DeriveReport};
pub use scheduler::spawn_periodic_sync;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SyncSource;
use crate::storage::{Backend, EntityKind, RecordStore, StoreError};

/// Step of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Export,
    Clear,
    Insert,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncStage::Export => "export",
            SyncStage::Clear => "clear",
            SyncStage::Insert => "insert",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("reconciliation of {entity} failed during {stage}: {source}")]
pub struct SyncError {
    pub entity: EntityKind,
    pub stage: SyncStage,
    #[source]
    pub source: StoreError,
}

/// Outcome of one successful reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub entity: EntityKind,
    pub source: Backend,
    pub destination: Backend,
    pub source_count: u64,
    pub deleted: u64,
    pub inserted: u64,
    /// Dependent rows the destination removed by cascade when this kind was cleared
    pub cascade_deleted: u64,
    /// Dependent kinds restored in the same run after a cascading clear
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<SyncReport>,
    pub duration_ms: u64,
}

/// Source vs destination comparison for one entity kind.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub entity: EntityKind,
    pub source_count: u64,
    pub destination_count: u64,
    /// Identity keys present in the source only
    pub missing_in_destination: Vec<String>,
    /// Identity keys present in the destination only
    pub unexpected_in_destination: Vec<String>,
    pub consistent: bool,
}

fn failure(kind: EntityKind, stage: SyncStage) -> impl FnOnce(StoreError) -> SyncError {
    move |source| {
        error!(entity = %kind, %stage, error = %source, "Reconciliation failed");
        SyncError {
            entity: kind,
            stage,
            source,
        }
    }
}

/// One-directional full-resync between two stores.
pub struct SyncReconciler {
    source: Arc<dyn RecordStore>,
    destination: Arc<dyn RecordStore>,
    /// One per kind, indexed by [`lock_slot`]
    locks: [Mutex<()>; 4],
}

const fn lock_slot(kind: EntityKind) -> usize {
    match kind {
        EntityKind::Applications => 0,
        EntityKind::Features => 1,
        EntityKind::Predictions => 2,
        EntityKind::Analytics => 3,
    }
}

impl SyncReconciler {
    pub fn new(source: Arc<dyn RecordStore>, destination: Arc<dyn RecordStore>) -> Self {
        Self {
            source,
            destination,
            locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Reconciler reading from the store `source` names.
    pub fn from_source(
        source: SyncSource,
        relational: Arc<dyn RecordStore>,
        document: Arc<dyn RecordStore>,
    ) -> Self {
        match source {
            SyncSource::Relational => Self::new(relational, document),
            SyncSource::Document => Self::new(document, relational),
        }
    }

    pub fn source(&self) -> Backend {
        self.source.backend()
    }

    pub fn destination(&self) -> Backend {
        self.destination.backend()
    }

    /// Kinds the destination drops along with `kind`.
    fn cascaded_kinds(&self, kind: EntityKind) -> &'static [EntityKind] {
        if kind == EntityKind::Applications && self.destination.cascades_deletes() {
            &[EntityKind::Features, EntityKind::Predictions]
        } else {
            &[]
        }
    }

    /// Replace the destination's `kind` records with the source's.
    ///
    /// When clearing `kind` cascades in the destination, the dependent kinds
    /// are restored in the same run and reported under `dependents`.
    /// Runs touching the same kind are serialized; locks are taken in
    /// parent-first order.
    pub async fn reconcile(&self, kind: EntityKind) -> Result<SyncReport, SyncError> {
        let cascaded = self.cascaded_kinds(kind);
        let _guard = self.locks[lock_slot(kind)].lock().await;
        let mut held = Vec::with_capacity(cascaded.len());
        for dependent in cascaded {
            held.push(self.locks[lock_slot(*dependent)].lock().await);
        }

        let mut cascade_deleted = 0;
        for dependent in cascaded {
            let existing = self
                .destination
                .export(*dependent)
                .await
                .map_err(failure(*dependent, SyncStage::Clear))?;
            cascade_deleted += existing.len() as u64;
        }

        let mut report = self.run(kind).await?;
        report.cascade_deleted = cascade_deleted;
        if cascade_deleted > 0 {
            info!(
                entity = %kind,
                destination = %report.destination,
                cascade_deleted,
                "Clearing removed dependent records; restoring them from the source"
            );
        }
        for dependent in cascaded {
            report.dependents.push(self.run(*dependent).await?);
        }
        Ok(report)
    }

    /// Export, clear and insert one kind. Callers hold its lock.
    async fn run(&self, kind: EntityKind) -> Result<SyncReport, SyncError> {
        let started = Instant::now();

        let records = self
            .source
            .export(kind)
            .await
            .map_err(failure(kind, SyncStage::Export))?;
        debug!(entity = %kind, count = records.len(), source = %self.source(), "Exported source records");

        let deleted = self
            .destination
            .clear(kind)
            .await
            .map_err(failure(kind, SyncStage::Clear))?;

        let inserted = if records.is_empty() {
            0
        } else {
            self.destination
                .insert_batch(&records)
                .await
                .map_err(failure(kind, SyncStage::Insert))?
        };

        let report = SyncReport {
            entity: kind,
            source: self.source(),
            destination: self.destination(),
            source_count: records.len() as u64,
            deleted,
            inserted,
            cascade_deleted: 0,
            dependents: Vec::new(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            entity = %kind,
            source = %report.source,
            destination = %report.destination,
            deleted,
            inserted,
            duration_ms = report.duration_ms,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Reconcile `kinds` in parent-first order, stopping at the first failure.
    ///
    /// Dependents restored after a cascading clear appear as their own
    /// entries and are not run a second time.
    pub async fn reconcile_many(&self, kinds: &[EntityKind]) -> Result<Vec<SyncReport>, SyncError> {
        let mut ordered = kinds.to_vec();
        ordered.sort();
        ordered.dedup();
        let mut reports: Vec<SyncReport> = Vec::with_capacity(ordered.len());
        for kind in ordered {
            if reports.iter().any(|r| r.entity == kind) {
                continue;
            }
            let mut report = self.reconcile(kind).await?;
            let dependents = std::mem::take(&mut report.dependents);
            reports.push(report);
            reports.extend(dependents);
        }
        Ok(reports)
    }

    /// Reconcile every entity kind, parents first.
    pub async fn reconcile_all(&self) -> Result<Vec<SyncReport>, SyncError> {
        self.reconcile_many(&EntityKind::ALL).await
    }

    /// Compare identity keys of `kind` in both stores.
    pub async fn verify(&self, kind: EntityKind) -> Result<VerifyReport, SyncError> {
        let export = |store: &Arc<dyn RecordStore>| {
            let store = Arc::clone(store);
            async move {
                store.export(kind).await.map_err(|source| SyncError {
                    entity: kind,
                    stage: SyncStage::Export,
                    source,
                })
            }
        };
        let source = export(&self.source).await?;
        let destination = export(&self.destination).await?;

        let source_keys = source.identity_keys();
        let destination_keys = destination.identity_keys();
        let missing: Vec<String> = source_keys.difference(&destination_keys).cloned().collect();
        let unexpected: Vec<String> = destination_keys.difference(&source_keys).cloned().collect();
        let consistent =
            missing.is_empty() && unexpected.is_empty() && source.len() == destination.len();

        if !consistent {
            warn!(
                entity = %kind,
                source_count = source.len(),
                destination_count = destination.len(),
                missing = missing.len(),
                unexpected = unexpected.len(),
                "Stores are out of sync"
            );
        }

        Ok(VerifyReport {
            entity: kind,
            source_count: source.len() as u64,
            destination_count: destination.len() as u64,
            missing_in_destination: missing,
            unexpected_in_destination: unexpected,
            consistent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentStore, RelationalStore};
    use crate::types::{
        timestamp_now, ApplicantProfile, LoanApplication, LoanStatus, NewApplication,
        NewPrediction, RawApplication,
    };

    fn app(id: &str) -> LoanApplication {
        let raw = RawApplication {
            gender: "Male".into(),
            married: "Yes".into(),
            dependents: "2".into(),
            education: "Not Graduate".into(),
            self_employed: "Yes".into(),
            applicant_income: 2600.0,
            coapplicant_income: 0.0,
            loan_amount: Some(90.0),
            loan_amount_term: Some(180),
            credit_history: Some(0),
            property_area: "Semiurban".into(),
        };
        NewApplication {
            loan_id: id.into(),
            profile: ApplicantProfile::try_from(&raw).unwrap(),
            loan_status: Some(LoanStatus::Rejected),
        }
        .into_application(timestamp_now())
    }

    #[tokio::test]
    async fn test_failed_insert_reports_stage() {
        let document = Arc::new(DocumentStore::temporary().unwrap());
        let relational = Arc::new(RelationalStore::in_memory().await.unwrap());

        // Prediction whose application exists only in the document store
        document.create_application(&app("ORPHAN")).await.unwrap();
        document
            .create_prediction(&NewPrediction {
                loan_id: "ORPHAN".into(),
                predicted_status: LoanStatus::Rejected,
                confidence_score: 0.8,
                probability_approved: 0.2,
                model_version: "v1".into(),
                feature_importance: None,
                prediction_created_at: timestamp_now(),
            })
            .await
            .unwrap();

        let reconciler = SyncReconciler::new(document, relational);
        let err = reconciler.reconcile(EntityKind::Predictions).await.unwrap_err();
        assert_eq!(err.stage, SyncStage::Insert);
        assert!(err.source.is_not_found());

        // Parent-first run succeeds and restores dependents once
        let reports = reconciler
            .reconcile_many(&[EntityKind::Predictions, EntityKind::Applications])
            .await
            .unwrap();
        let kinds: Vec<EntityKind> = reports.iter().map(|r| r.entity).collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Applications, EntityKind::Features, EntityKind::Predictions]
        );
        assert_eq!(reports[2].inserted, 1);
        assert!(reconciler.verify(EntityKind::Predictions).await.unwrap().consistent);
    }
}
