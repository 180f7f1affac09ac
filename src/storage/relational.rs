//! Relational backend (SQLite via sqlx)
//!
//! Schema lives in `migrations/`. Features and predictions reference their
//! application with `ON DELETE CASCADE`, so deleting an application (or
//! clearing the applications table) removes its dependents in the same
//! statement. Timestamps are stored as fixed-width UTC text so that text
//! ordering is chronological ordering.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info};

use super::{
    ApplicationFilter, Backend, EntityKind, EntityRecords, FeatureFilter, Page, PredictionFilter,
    RecordStore, StoreError,
};
use crate::types::{
    approval_rate, format_timestamp, parse_timestamp, timestamp_now, AnalyticsSnapshot,
    ApplicantProfile, ApplicationPatch, ApplicationStatistics, FeatureRecord, FeatureVector,
    LoanApplication, LoanStatus, NewPrediction, NewSnapshot, Prediction, RawApplication,
};

const APPLICATION: &str = EntityKind::Applications.record_name();
const FEATURES: &str = EntityKind::Features.record_name();
const PREDICTION: &str = EntityKind::Predictions.record_name();
const SNAPSHOT: &str = EntityKind::Analytics.record_name();

/// Relational store over a SQLite connection pool.
#[derive(Clone)]
pub struct RelationalStore {
    pool: SqlitePool,
}

impl RelationalStore {
    /// Connect, creating the database file if needed, and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?
            .create_if_missing(true)
            .foreign_keys(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;

        info!(url = %database_url, "Connected to relational store");
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?
            .foreign_keys(true);
        // Every new connection would see a fresh empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations from the migrations/ directory
    pub async fn migrate(&self) -> Result<(), StoreError> {
        debug!("Running relational migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))
    }
}

fn sql_err<'a>(entity: &'static str, key: &'a str) -> impl FnOnce(sqlx::Error) -> StoreError + 'a {
    move |e| StoreError::from_sqlx(e, entity, key)
}

fn limit_offset(page: Page) -> (i64, i64) {
    (
        i64::try_from(page.limit).unwrap_or(i64::MAX),
        i64::try_from(page.offset).unwrap_or(i64::MAX),
    )
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(FromRow)]
struct ApplicationRow {
    loan_id: String,
    gender: String,
    married: String,
    dependents: String,
    education: String,
    self_employed: String,
    applicant_income: f64,
    coapplicant_income: f64,
    loan_amount: Option<f64>,
    loan_amount_term: Option<i64>,
    credit_history: Option<i64>,
    property_area: String,
    loan_status: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ApplicationRow {
    fn into_application(self) -> Result<LoanApplication, StoreError> {
        let corrupt = |msg: String| StoreError::corrupt(Backend::Relational, APPLICATION, msg);
        let raw = RawApplication {
            gender: self.gender,
            married: self.married,
            dependents: self.dependents,
            education: self.education,
            self_employed: self.self_employed,
            applicant_income: self.applicant_income,
            coapplicant_income: self.coapplicant_income,
            loan_amount: self.loan_amount,
            loan_amount_term: self.loan_amount_term,
            credit_history: self.credit_history,
            property_area: self.property_area,
        };
        let profile = ApplicantProfile::try_from(&raw)
            .map_err(|e| corrupt(format!("{}: {e}", self.loan_id)))?;
        let loan_status = self
            .loan_status
            .as_deref()
            .map(LoanStatus::parse)
            .transpose()
            .map_err(|e| corrupt(format!("{}: {e}", self.loan_id)))?;
        Ok(LoanApplication {
            profile,
            loan_status,
            created_at: parse_timestamp(&self.created_at).map_err(|e| corrupt(e.to_string()))?,
            updated_at: parse_timestamp(&self.updated_at).map_err(|e| corrupt(e.to_string()))?,
            loan_id: self.loan_id,
        })
    }
}

#[derive(FromRow)]
struct FeatureRow {
    loan_id: String,
    gender_male: f64,
    married_yes: f64,
    education_graduate: f64,
    self_employed_yes: f64,
    credit_history: f64,
    dependents_count: f64,
    property_area_code: f64,
    applicant_income: f64,
    coapplicant_income: f64,
    loan_amount: f64,
    loan_amount_term: f64,
    total_income: f64,
    income_to_loan_ratio: f64,
    monthly_payment: f64,
    derived_at: String,
}

impl FeatureRow {
    fn into_record(self) -> Result<FeatureRecord, StoreError> {
        let derived_at = parse_timestamp(&self.derived_at)
            .map_err(|e| StoreError::corrupt(Backend::Relational, FEATURES, e))?;
        Ok(FeatureRecord {
            loan_id: self.loan_id,
            features: FeatureVector {
                gender_male: self.gender_male,
                married_yes: self.married_yes,
                education_graduate: self.education_graduate,
                self_employed_yes: self.self_employed_yes,
                credit_history: self.credit_history,
                dependents_count: self.dependents_count,
                property_area_code: self.property_area_code,
                applicant_income: self.applicant_income,
                coapplicant_income: self.coapplicant_income,
                loan_amount: self.loan_amount,
                loan_amount_term: self.loan_amount_term,
                total_income: self.total_income,
                income_to_loan_ratio: self.income_to_loan_ratio,
                monthly_payment: self.monthly_payment,
            },
            derived_at,
        })
    }
}

#[derive(FromRow)]
struct PredictionRow {
    prediction_id: i64,
    loan_id: String,
    predicted_status: String,
    confidence_score: f64,
    probability_approved: f64,
    model_version: String,
    feature_importance: Option<String>,
    created_at: String,
}

impl PredictionRow {
    fn into_prediction(self) -> Result<Prediction, StoreError> {
        let corrupt = |msg: String| StoreError::corrupt(Backend::Relational, PREDICTION, msg);
        let feature_importance = self
            .feature_importance
            .as_deref()
            .map(serde_json::from_str::<BTreeMap<String, f64>>)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        Ok(Prediction {
            prediction_id: self.prediction_id,
            predicted_status: LoanStatus::parse(&self.predicted_status)
                .map_err(|e| corrupt(e.to_string()))?,
            confidence_score: self.confidence_score,
            probability_approved: self.probability_approved,
            feature_importance,
            prediction_created_at: parse_timestamp(&self.created_at)
                .map_err(|e| corrupt(e.to_string()))?,
            loan_id: self.loan_id,
            model_version: self.model_version,
        })
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    analytics_id: i64,
    analysis_date: String,
    total_applications: i64,
    approved_loans: i64,
    rejected_loans: i64,
    approval_rate: f64,
    avg_loan_amount: f64,
    avg_applicant_income: f64,
    avg_coapplicant_income: f64,
    gender_distribution: String,
    education_distribution: String,
    property_area_distribution: String,
    income_ranges: String,
    created_at: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<AnalyticsSnapshot, StoreError> {
        let corrupt = |msg: String| StoreError::corrupt(Backend::Relational, SNAPSHOT, msg);
        let dist = |text: &str| {
            serde_json::from_str::<BTreeMap<String, u64>>(text).map_err(|e| corrupt(e.to_string()))
        };
        let count = |v: i64| u64::try_from(v).map_err(|e| corrupt(e.to_string()));
        Ok(AnalyticsSnapshot {
            analytics_id: self.analytics_id,
            analysis_date: parse_timestamp(&self.analysis_date).map_err(|e| corrupt(e.to_string()))?,
            statistics: ApplicationStatistics {
                total_applications: count(self.total_applications)?,
                approved_loans: count(self.approved_loans)?,
                rejected_loans: count(self.rejected_loans)?,
                approval_rate: self.approval_rate,
                avg_loan_amount: self.avg_loan_amount,
                avg_applicant_income: self.avg_applicant_income,
                avg_coapplicant_income: self.avg_coapplicant_income,
                gender_distribution: dist(&self.gender_distribution)?,
                education_distribution: dist(&self.education_distribution)?,
                property_area_distribution: dist(&self.property_area_distribution)?,
                income_ranges: dist(&self.income_ranges)?,
            },
            created_at: parse_timestamp(&self.created_at).map_err(|e| corrupt(e.to_string()))?,
        })
    }
}

// ============================================================================
// Statement helpers (shared by single-row and batch paths)
// ============================================================================

async fn insert_application(conn: &mut SqliteConnection, app: &LoanApplication) -> Result<(), StoreError> {
    let p = &app.profile;
    sqlx::query(
        "INSERT INTO loan_applications (loan_id, gender, married, dependents, education, \
         self_employed, applicant_income, coapplicant_income, loan_amount, loan_amount_term, \
         credit_history, property_area, loan_status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&app.loan_id)
    .bind(p.gender.as_str())
    .bind(p.married.as_str())
    .bind(p.dependents.as_str())
    .bind(p.education.as_str())
    .bind(p.self_employed.as_str())
    .bind(p.applicant_income)
    .bind(p.coapplicant_income)
    .bind(p.loan_amount)
    .bind(p.loan_amount_term.map(i64::from))
    .bind(p.credit_history.map(i64::from))
    .bind(p.property_area.as_str())
    .bind(app.loan_status.map(|s| s.as_str()))
    .bind(format_timestamp(&app.created_at))
    .bind(format_timestamp(&app.updated_at))
    .execute(conn)
    .await
    .map_err(sql_err(APPLICATION, &app.loan_id))?;
    Ok(())
}

async fn upsert_application(conn: &mut SqliteConnection, app: &LoanApplication) -> Result<(), StoreError> {
    let p = &app.profile;
    sqlx::query(
        "INSERT INTO loan_applications (loan_id, gender, married, dependents, education, \
         self_employed, applicant_income, coapplicant_income, loan_amount, loan_amount_term, \
         credit_history, property_area, loan_status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (loan_id) DO UPDATE SET \
         gender = excluded.gender, married = excluded.married, dependents = excluded.dependents, \
         education = excluded.education, self_employed = excluded.self_employed, \
         applicant_income = excluded.applicant_income, \
         coapplicant_income = excluded.coapplicant_income, loan_amount = excluded.loan_amount, \
         loan_amount_term = excluded.loan_amount_term, credit_history = excluded.credit_history, \
         property_area = excluded.property_area, loan_status = excluded.loan_status, \
         created_at = excluded.created_at, updated_at = excluded.updated_at",
    )
    .bind(&app.loan_id)
    .bind(p.gender.as_str())
    .bind(p.married.as_str())
    .bind(p.dependents.as_str())
    .bind(p.education.as_str())
    .bind(p.self_employed.as_str())
    .bind(p.applicant_income)
    .bind(p.coapplicant_income)
    .bind(p.loan_amount)
    .bind(p.loan_amount_term.map(i64::from))
    .bind(p.credit_history.map(i64::from))
    .bind(p.property_area.as_str())
    .bind(app.loan_status.map(|s| s.as_str()))
    .bind(format_timestamp(&app.created_at))
    .bind(format_timestamp(&app.updated_at))
    .execute(conn)
    .await
    .map_err(sql_err(APPLICATION, &app.loan_id))?;
    Ok(())
}

async fn upsert_features(conn: &mut SqliteConnection, record: &FeatureRecord) -> Result<(), StoreError> {
    let f = &record.features;
    sqlx::query(
        "INSERT INTO loan_features (loan_id, gender_male, married_yes, education_graduate, \
         self_employed_yes, credit_history, dependents_count, property_area_code, \
         applicant_income, coapplicant_income, loan_amount, loan_amount_term, total_income, \
         income_to_loan_ratio, monthly_payment, derived_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (loan_id) DO UPDATE SET \
         gender_male = excluded.gender_male, married_yes = excluded.married_yes, \
         education_graduate = excluded.education_graduate, \
         self_employed_yes = excluded.self_employed_yes, credit_history = excluded.credit_history, \
         dependents_count = excluded.dependents_count, \
         property_area_code = excluded.property_area_code, \
         applicant_income = excluded.applicant_income, \
         coapplicant_income = excluded.coapplicant_income, loan_amount = excluded.loan_amount, \
         loan_amount_term = excluded.loan_amount_term, total_income = excluded.total_income, \
         income_to_loan_ratio = excluded.income_to_loan_ratio, \
         monthly_payment = excluded.monthly_payment, derived_at = excluded.derived_at",
    )
    .bind(&record.loan_id)
    .bind(f.gender_male)
    .bind(f.married_yes)
    .bind(f.education_graduate)
    .bind(f.self_employed_yes)
    .bind(f.credit_history)
    .bind(f.dependents_count)
    .bind(f.property_area_code)
    .bind(f.applicant_income)
    .bind(f.coapplicant_income)
    .bind(f.loan_amount)
    .bind(f.loan_amount_term)
    .bind(f.total_income)
    .bind(f.income_to_loan_ratio)
    .bind(f.monthly_payment)
    .bind(format_timestamp(&record.derived_at))
    .execute(conn)
    .await
    .map_err(sql_err(FEATURES, &record.loan_id))?;
    Ok(())
}

/// Insert a prediction; `prediction_id = None` lets SQLite assign one.
async fn insert_prediction(
    conn: &mut SqliteConnection,
    prediction_id: Option<i64>,
    p: &NewPrediction,
) -> Result<i64, StoreError> {
    let importance = p
        .feature_importance
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::corrupt(Backend::Relational, PREDICTION, e))?;
    let result = sqlx::query(
        "INSERT INTO loan_predictions (prediction_id, loan_id, predicted_status, \
         confidence_score, probability_approved, model_version, feature_importance, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(prediction_id)
    .bind(&p.loan_id)
    .bind(p.predicted_status.as_str())
    .bind(p.confidence_score)
    .bind(p.probability_approved)
    .bind(&p.model_version)
    .bind(importance)
    .bind(format_timestamp(&p.prediction_created_at))
    .execute(conn)
    .await
    .map_err(sql_err(PREDICTION, &p.loan_id))?;
    Ok(result.last_insert_rowid())
}

async fn insert_snapshot(
    conn: &mut SqliteConnection,
    analytics_id: Option<i64>,
    snapshot: &NewSnapshot,
    created_at: &chrono::DateTime<chrono::Utc>,
) -> Result<i64, StoreError> {
    let s = &snapshot.statistics;
    let json = |m: &BTreeMap<String, u64>| {
        serde_json::to_string(m).map_err(|e| StoreError::corrupt(Backend::Relational, SNAPSHOT, e))
    };
    let count = |v: u64| {
        i64::try_from(v).map_err(|e| StoreError::corrupt(Backend::Relational, SNAPSHOT, e))
    };
    let key = format_timestamp(&snapshot.analysis_date);
    let result = sqlx::query(
        "INSERT INTO loan_analytics (analytics_id, analysis_date, total_applications, \
         approved_loans, rejected_loans, approval_rate, avg_loan_amount, avg_applicant_income, \
         avg_coapplicant_income, gender_distribution, education_distribution, \
         property_area_distribution, income_ranges, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(analytics_id)
    .bind(&key)
    .bind(count(s.total_applications)?)
    .bind(count(s.approved_loans)?)
    .bind(count(s.rejected_loans)?)
    .bind(s.approval_rate)
    .bind(s.avg_loan_amount)
    .bind(s.avg_applicant_income)
    .bind(s.avg_coapplicant_income)
    .bind(json(&s.gender_distribution)?)
    .bind(json(&s.education_distribution)?)
    .bind(json(&s.property_area_distribution)?)
    .bind(json(&s.income_ranges)?)
    .bind(format_timestamp(created_at))
    .execute(conn)
    .await
    .map_err(sql_err(SNAPSHOT, &key))?;
    Ok(result.last_insert_rowid())
}

fn push_application_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ApplicationFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(g) = filter.gender {
        qb.push(" AND gender = ").push_bind(g.as_str());
    }
    if let Some(e) = filter.education {
        qb.push(" AND education = ").push_bind(e.as_str());
    }
    if let Some(a) = filter.property_area {
        qb.push(" AND property_area = ").push_bind(a.as_str());
    }
    if let Some(s) = filter.loan_status {
        qb.push(" AND loan_status = ").push_bind(s.as_str());
    }
    if let Some(min) = filter.min_income {
        qb.push(" AND applicant_income >= ").push_bind(min);
    }
    if let Some(max) = filter.max_income {
        qb.push(" AND applicant_income <= ").push_bind(max);
    }
}

// ============================================================================
// RecordStore
// ============================================================================

fn counts(rows: Vec<(String, i64)>) -> BTreeMap<String, u64> {
    rows.into_iter().map(|(k, v)| (k, v.max(0) as u64)).collect()
}

/// Row count per distinct value of `column`.
async fn distribution(
    conn: &mut SqliteConnection,
    column: &'static str,
) -> Result<BTreeMap<String, u64>, StoreError> {
    let sql = format!(
        "SELECT {column}, COUNT(*) FROM loan_applications GROUP BY {column} ORDER BY {column}"
    );
    let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(sql_err(APPLICATION, "statistics"))?;
    Ok(counts(rows))
}

#[async_trait]
impl RecordStore for RelationalStore {
    fn backend(&self) -> Backend {
        Backend::Relational
    }

    fn cascades_deletes(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;
        Ok(())
    }

    async fn create_application(&self, app: &LoanApplication) -> Result<(), StoreError> {
        app.profile.validate()?;
        let mut conn = self.conn().await?;
        insert_application(&mut conn, app).await?;
        debug!(loan_id = %app.loan_id, "Application inserted (relational)");
        Ok(())
    }

    async fn get_application(&self, loan_id: &str) -> Result<LoanApplication, StoreError> {
        sqlx::query_as::<_, ApplicationRow>("SELECT * FROM loan_applications WHERE loan_id = ?")
            .bind(loan_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err(APPLICATION, loan_id))?
            .ok_or_else(|| StoreError::not_found(APPLICATION, loan_id))?
            .into_application()
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: Page,
    ) -> Result<Vec<LoanApplication>, StoreError> {
        let (limit, offset) = limit_offset(page);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM loan_applications");
        push_application_filter(&mut qb, filter);
        qb.push(" ORDER BY loan_id LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        qb.build_query_as::<ApplicationRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err(APPLICATION, "*"))?
            .into_iter()
            .map(ApplicationRow::into_application)
            .collect()
    }

    async fn count_applications(&self, filter: &ApplicationFilter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM loan_applications");
        push_application_filter(&mut qb, filter);
        let (count,): (i64,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(sql_err(APPLICATION, "*"))?;
        Ok(count.max(0) as u64)
    }

    async fn update_application(
        &self,
        loan_id: &str,
        patch: &ApplicationPatch,
    ) -> Result<LoanApplication, StoreError> {
        // Take the write lock before reading so concurrent updates queue on
        // busy_timeout instead of failing the lock upgrade
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;

        let mut app = sqlx::query_as::<_, ApplicationRow>("SELECT * FROM loan_applications WHERE loan_id = ?")
            .bind(loan_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sql_err(APPLICATION, loan_id))?
            .ok_or_else(|| StoreError::not_found(APPLICATION, loan_id))?
            .into_application()?;

        patch.apply(&mut app, timestamp_now())?;

        let p = &app.profile;
        sqlx::query(
            "UPDATE loan_applications SET gender = ?, married = ?, dependents = ?, education = ?, \
             self_employed = ?, applicant_income = ?, coapplicant_income = ?, loan_amount = ?, \
             loan_amount_term = ?, credit_history = ?, property_area = ?, loan_status = ?, \
             updated_at = ? WHERE loan_id = ?",
        )
        .bind(p.gender.as_str())
        .bind(p.married.as_str())
        .bind(p.dependents.as_str())
        .bind(p.education.as_str())
        .bind(p.self_employed.as_str())
        .bind(p.applicant_income)
        .bind(p.coapplicant_income)
        .bind(p.loan_amount)
        .bind(p.loan_amount_term.map(i64::from))
        .bind(p.credit_history.map(i64::from))
        .bind(p.property_area.as_str())
        .bind(app.loan_status.map(|s| s.as_str()))
        .bind(format_timestamp(&app.updated_at))
        .bind(loan_id)
        .execute(&mut *tx)
        .await
        .map_err(sql_err(APPLICATION, loan_id))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;
        Ok(app)
    }

    async fn delete_application(&self, loan_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM loan_applications WHERE loan_id = ?")
            .bind(loan_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err(APPLICATION, loan_id))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(APPLICATION, loan_id));
        }
        debug!(loan_id, "Application deleted with cascaded dependents (relational)");
        Ok(())
    }

    async fn put_application(&self, app: &LoanApplication) -> Result<(), StoreError> {
        app.profile.validate()?;
        let mut conn = self.conn().await?;
        upsert_application(&mut conn, app).await
    }

    async fn upsert_features(&self, record: &FeatureRecord) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        upsert_features(&mut conn, record).await
    }

    async fn get_features(&self, loan_id: &str) -> Result<FeatureRecord, StoreError> {
        sqlx::query_as::<_, FeatureRow>("SELECT * FROM loan_features WHERE loan_id = ?")
            .bind(loan_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err(FEATURES, loan_id))?
            .ok_or_else(|| StoreError::not_found(FEATURES, loan_id))?
            .into_record()
    }

    async fn list_features(
        &self,
        filter: &FeatureFilter,
        page: Page,
    ) -> Result<Vec<FeatureRecord>, StoreError> {
        let (limit, offset) = limit_offset(page);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM loan_features");
        if let Some(since) = &filter.derived_since {
            qb.push(" WHERE derived_at >= ").push_bind(format_timestamp(since));
        }
        qb.push(" ORDER BY loan_id LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        qb.build_query_as::<FeatureRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err(FEATURES, "*"))?
            .into_iter()
            .map(FeatureRow::into_record)
            .collect()
    }

    async fn delete_features(&self, loan_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM loan_features WHERE loan_id = ?")
            .bind(loan_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err(FEATURES, loan_id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_prediction(&self, prediction: &NewPrediction) -> Result<Prediction, StoreError> {
        prediction.validate()?;
        let mut conn = self.conn().await?;
        let id = insert_prediction(&mut conn, None, prediction).await?;
        Ok(prediction.clone().with_id(id))
    }

    async fn get_prediction(&self, prediction_id: i64) -> Result<Prediction, StoreError> {
        let key = prediction_id.to_string();
        sqlx::query_as::<_, PredictionRow>("SELECT * FROM loan_predictions WHERE prediction_id = ?")
            .bind(prediction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err(PREDICTION, &key))?
            .ok_or_else(|| StoreError::not_found(PREDICTION, &key))?
            .into_prediction()
    }

    async fn list_predictions(
        &self,
        filter: &PredictionFilter,
        page: Page,
    ) -> Result<Vec<Prediction>, StoreError> {
        let (limit, offset) = limit_offset(page);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM loan_predictions WHERE 1 = 1");
        if let Some(loan_id) = &filter.loan_id {
            qb.push(" AND loan_id = ").push_bind(loan_id.as_str());
        }
        if let Some(version) = &filter.model_version {
            qb.push(" AND model_version = ").push_bind(version.as_str());
        }
        qb.push(" ORDER BY created_at, prediction_id LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        qb.build_query_as::<PredictionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err(PREDICTION, "*"))?
            .into_iter()
            .map(PredictionRow::into_prediction)
            .collect()
    }

    async fn delete_prediction(&self, prediction_id: i64) -> Result<(), StoreError> {
        let key = prediction_id.to_string();
        let result = sqlx::query("DELETE FROM loan_predictions WHERE prediction_id = ?")
            .bind(prediction_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err(PREDICTION, &key))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(PREDICTION, key));
        }
        Ok(())
    }

    async fn delete_predictions_for(&self, loan_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM loan_predictions WHERE loan_id = ?")
            .bind(loan_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err(PREDICTION, loan_id))?;
        Ok(result.rows_affected())
    }

    async fn create_snapshot(&self, snapshot: &NewSnapshot) -> Result<AnalyticsSnapshot, StoreError> {
        let created_at = timestamp_now();
        let mut conn = self.conn().await?;
        let id = insert_snapshot(&mut conn, None, snapshot, &created_at).await?;
        Ok(snapshot.clone().with_id(id, created_at))
    }

    async fn get_snapshot(&self, analytics_id: i64) -> Result<AnalyticsSnapshot, StoreError> {
        let key = analytics_id.to_string();
        sqlx::query_as::<_, SnapshotRow>("SELECT * FROM loan_analytics WHERE analytics_id = ?")
            .bind(analytics_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err(SNAPSHOT, &key))?
            .ok_or_else(|| StoreError::not_found(SNAPSHOT, &key))?
            .into_snapshot()
    }

    async fn latest_snapshot(&self) -> Result<Option<AnalyticsSnapshot>, StoreError> {
        sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM loan_analytics ORDER BY analysis_date DESC, analytics_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err(SNAPSHOT, "latest"))?
        .map(SnapshotRow::into_snapshot)
        .transpose()
    }

    async fn list_snapshots(&self, page: Page) -> Result<Vec<AnalyticsSnapshot>, StoreError> {
        let (limit, offset) = limit_offset(page);
        sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM loan_analytics ORDER BY analysis_date DESC, analytics_id DESC \
             LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err(SNAPSHOT, "*"))?
        .into_iter()
        .map(SnapshotRow::into_snapshot)
        .collect()
    }

    /// All aggregates are read inside one transaction, so they describe the
    /// same set of rows.
    async fn statistics(&self) -> Result<ApplicationStatistics, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;

        let (total, approved, rejected, avg_amount, avg_income, avg_coincome): (
            i64,
            i64,
            i64,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = sqlx::query_as(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN loan_status = 'Y' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN loan_status = 'N' THEN 1 ELSE 0 END), 0), \
             AVG(loan_amount), AVG(applicant_income), AVG(coapplicant_income) \
             FROM loan_applications",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(sql_err(APPLICATION, "statistics"))?;

        let gender_distribution = distribution(&mut tx, "gender").await?;
        let education_distribution = distribution(&mut tx, "education").await?;
        let property_area_distribution = distribution(&mut tx, "property_area").await?;

        let income_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT CASE \
               WHEN applicant_income < 2500 THEN '<2500' \
               WHEN applicant_income < 5000 THEN '2500-4999' \
               WHEN applicant_income < 10000 THEN '5000-9999' \
               ELSE '>=10000' END AS bucket, COUNT(*) \
             FROM loan_applications GROUP BY bucket",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err(APPLICATION, "statistics"))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;

        let total = total.max(0) as u64;
        let approved = approved.max(0) as u64;
        Ok(ApplicationStatistics {
            total_applications: total,
            approved_loans: approved,
            rejected_loans: rejected.max(0) as u64,
            approval_rate: approval_rate(approved, total),
            avg_loan_amount: avg_amount.unwrap_or(0.0),
            avg_applicant_income: avg_income.unwrap_or(0.0),
            avg_coapplicant_income: avg_coincome.unwrap_or(0.0),
            gender_distribution,
            education_distribution,
            property_area_distribution,
            income_ranges: counts(income_rows),
        })
    }

    async fn export(&self, kind: EntityKind) -> Result<EntityRecords, StoreError> {
        let all = Page::all();
        Ok(match kind {
            EntityKind::Applications => EntityRecords::Applications(
                self.list_applications(&ApplicationFilter::default(), all).await?,
            ),
            EntityKind::Features => {
                let rows: Vec<FeatureRow> =
                    sqlx::query_as("SELECT * FROM loan_features ORDER BY loan_id")
                        .fetch_all(&self.pool)
                        .await
                        .map_err(sql_err(FEATURES, "*"))?;
                EntityRecords::Features(
                    rows.into_iter()
                        .map(FeatureRow::into_record)
                        .collect::<Result<_, _>>()?,
                )
            }
            EntityKind::Predictions => EntityRecords::Predictions(
                self.list_predictions(&PredictionFilter::default(), all).await?,
            ),
            EntityKind::Analytics => EntityRecords::Analytics(self.list_snapshots(all).await?),
        })
    }

    async fn clear(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let sql = match kind {
            EntityKind::Applications => "DELETE FROM loan_applications",
            EntityKind::Features => "DELETE FROM loan_features",
            EntityKind::Predictions => "DELETE FROM loan_predictions",
            EntityKind::Analytics => "DELETE FROM loan_analytics",
        };
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(sql_err(kind.record_name(), "*"))?;
        debug!(entity = %kind, rows = result.rows_affected(), "Cleared relational table");
        Ok(result.rows_affected())
    }

    async fn insert_batch(&self, records: &EntityRecords) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;

        match records {
            EntityRecords::Applications(apps) => {
                for app in apps {
                    insert_application(&mut tx, app).await?;
                }
            }
            EntityRecords::Features(features) => {
                for record in features {
                    upsert_features(&mut tx, record).await?;
                }
            }
            EntityRecords::Predictions(predictions) => {
                for p in predictions {
                    let new = NewPrediction {
                        loan_id: p.loan_id.clone(),
                        predicted_status: p.predicted_status,
                        confidence_score: p.confidence_score,
                        probability_approved: p.probability_approved,
                        model_version: p.model_version.clone(),
                        feature_importance: p.feature_importance.clone(),
                        prediction_created_at: p.prediction_created_at,
                    };
                    insert_prediction(&mut tx, Some(p.prediction_id), &new).await?;
                }
            }
            EntityRecords::Analytics(snapshots) => {
                for s in snapshots {
                    let new = NewSnapshot {
                        analysis_date: s.analysis_date,
                        statistics: s.statistics.clone(),
                    };
                    insert_snapshot(&mut tx, Some(s.analytics_id), &new, &s.created_at).await?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::unavailable(Backend::Relational, e))?;
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gender, NewApplication};

    fn app(id: &str, income: f64, status: Option<LoanStatus>) -> LoanApplication {
        let raw = RawApplication {
            gender: "Male".into(),
            married: "No".into(),
            dependents: "0".into(),
            education: "Graduate".into(),
            self_employed: "No".into(),
            applicant_income: income,
            coapplicant_income: 0.0,
            loan_amount: Some(100.0),
            loan_amount_term: Some(360),
            credit_history: Some(1),
            property_area: "Urban".into(),
        };
        NewApplication {
            loan_id: id.into(),
            profile: ApplicantProfile::try_from(&raw).unwrap(),
            loan_status: status,
        }
        .into_application(timestamp_now())
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let store = RelationalStore::in_memory().await.unwrap();
        let original = app("L1", 5000.0, None);
        store.create_application(&original).await.unwrap();
        assert_eq!(store.get_application("L1").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_duplicate_key() {
        let store = RelationalStore::in_memory().await.unwrap();
        store.create_application(&app("L1", 5000.0, None)).await.unwrap();
        let err = store.create_application(&app("L1", 6000.0, None)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_prediction_for_unknown_loan_is_not_found() {
        let store = RelationalStore::in_memory().await.unwrap();
        let p = NewPrediction {
            loan_id: "NOPE".into(),
            predicted_status: LoanStatus::Approved,
            confidence_score: 0.9,
            probability_approved: 0.9,
            model_version: "v1".into(),
            feature_importance: None,
            prediction_created_at: timestamp_now(),
        };
        let err = store.create_prediction(&p).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test]
    async fn test_filtered_list_and_count() {
        let store = RelationalStore::in_memory().await.unwrap();
        for (id, income, status) in [
            ("A", 1000.0, Some(LoanStatus::Approved)),
            ("B", 4000.0, Some(LoanStatus::Rejected)),
            ("C", 8000.0, Some(LoanStatus::Approved)),
        ] {
            store.create_application(&app(id, income, status)).await.unwrap();
        }
        let filter = ApplicationFilter {
            loan_status: Some(LoanStatus::Approved),
            min_income: Some(2000.0),
            gender: Some(Gender::Male),
            ..Default::default()
        };
        let found = store.list_applications(&filter, Page::new(0, 10)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].loan_id, "C");
        assert_eq!(store.count_applications(&ApplicationFilter::default()).await.unwrap(), 3);

        let second_page = store
            .list_applications(&ApplicationFilter::default(), Page::new(1, 1))
            .await
            .unwrap();
        assert_eq!(second_page[0].loan_id, "B");
    }

    #[tokio::test]
    async fn test_sql_statistics_match_scan() {
        let store = RelationalStore::in_memory().await.unwrap();
        let apps = vec![
            app("A", 1000.0, Some(LoanStatus::Approved)),
            app("B", 4000.0, Some(LoanStatus::Rejected)),
            app("C", 12000.0, None),
        ];
        for a in &apps {
            store.create_application(a).await.unwrap();
        }
        let sql = store.statistics().await.unwrap();
        let scan = ApplicationStatistics::from_applications(&apps);
        assert_eq!(sql.total_applications, scan.total_applications);
        assert_eq!(sql.approval_rate, scan.approval_rate);
        assert_eq!(sql.income_ranges, scan.income_ranges);
        assert_eq!(sql.gender_distribution, scan.gender_distribution);
        assert!((sql.avg_applicant_income - scan.avg_applicant_income).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_on_shared_file_all_commit() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("loans.db").display());
        let store = RelationalStore::connect(&url, 4).await.unwrap();
        store.create_application(&app("L1", 1000.0, None)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let writer = store.clone();
            handles.push(tokio::spawn(async move {
                let patch = ApplicationPatch {
                    applicant_income: Some(2000.0 + f64::from(i)),
                    ..Default::default()
                };
                writer.update_application("L1", &patch).await.map(|_| ())
            }));
            let reader = store.clone();
            handles.push(tokio::spawn(async move {
                let stats = reader.statistics().await?;
                assert_eq!(stats.total_applications, 1);
                assert_eq!(stats.gender_distribution.values().sum::<u64>(), 1);
                Ok::<(), StoreError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let income = store.get_application("L1").await.unwrap().profile.applicant_income;
        assert!((2000.0..2008.0).contains(&income), "{income}");
        store.close().await;
    }

    #[tokio::test]
    async fn test_single_record_lookups_and_deletes() {
        let store = RelationalStore::in_memory().await.unwrap();
        store.create_application(&app("L1", 3000.0, None)).await.unwrap();
        let p = NewPrediction {
            loan_id: "L1".into(),
            predicted_status: LoanStatus::Approved,
            confidence_score: 0.7,
            probability_approved: 0.7,
            model_version: "v1".into(),
            feature_importance: None,
            prediction_created_at: timestamp_now(),
        };
        let stored = store.create_prediction(&p).await.unwrap();
        store.delete_prediction(stored.prediction_id).await.unwrap();
        assert!(store
            .delete_prediction(stored.prediction_id)
            .await
            .unwrap_err()
            .is_not_found());

        let snapshot = store
            .create_snapshot(&NewSnapshot {
                analysis_date: timestamp_now(),
                statistics: store.statistics().await.unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(store.get_snapshot(snapshot.analytics_id).await.unwrap(), snapshot);
        assert!(store.get_snapshot(snapshot.analytics_id + 1).await.unwrap_err().is_not_found());
    }
}
