//! Aggregate statistics and immutable analytics snapshots

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::application::{LoanApplication, LoanStatus};

/// Applicant income histogram buckets, lowest first.
pub const INCOME_BUCKETS: [&str; 4] = ["<2500", "2500-4999", "5000-9999", ">=10000"];

/// Bucket label for an applicant income.
pub fn income_bucket(applicant_income: f64) -> &'static str {
    if applicant_income < 2500.0 {
        INCOME_BUCKETS[0]
    } else if applicant_income < 5000.0 {
        INCOME_BUCKETS[1]
    } else if applicant_income < 10000.0 {
        INCOME_BUCKETS[2]
    } else {
        INCOME_BUCKETS[3]
    }
}

/// Round to two decimals (approval rate presentation).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Point-in-time aggregate over all applications.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationStatistics {
    pub total_applications: u64,
    pub approved_loans: u64,
    pub rejected_loans: u64,
    /// Percentage in [0, 100], two decimals
    pub approval_rate: f64,
    /// Mean over applications that carry a loan amount
    pub avg_loan_amount: f64,
    pub avg_applicant_income: f64,
    pub avg_coapplicant_income: f64,
    pub gender_distribution: BTreeMap<String, u64>,
    pub education_distribution: BTreeMap<String, u64>,
    pub property_area_distribution: BTreeMap<String, u64>,
    #[serde(default)]
    pub income_ranges: BTreeMap<String, u64>,
}

impl ApplicationStatistics {
    /// Compute from a full scan. Used by backends without native aggregation.
    pub fn from_applications(apps: &[LoanApplication]) -> Self {
        let mut stats = Self {
            total_applications: apps.len() as u64,
            ..Self::default()
        };

        let mut applicant_sum = 0.0;
        let mut coapplicant_sum = 0.0;
        let mut amount_sum = 0.0;
        let mut amount_n = 0u64;

        for app in apps {
            match app.loan_status {
                Some(LoanStatus::Approved) => stats.approved_loans += 1,
                Some(LoanStatus::Rejected) => stats.rejected_loans += 1,
                None => {}
            }
            let p = &app.profile;
            applicant_sum += p.applicant_income;
            coapplicant_sum += p.coapplicant_income;
            if let Some(amount) = p.loan_amount {
                amount_sum += amount;
                amount_n += 1;
            }
            *stats.gender_distribution.entry(p.gender.to_string()).or_default() += 1;
            *stats.education_distribution.entry(p.education.to_string()).or_default() += 1;
            *stats
                .property_area_distribution
                .entry(p.property_area.to_string())
                .or_default() += 1;
            *stats
                .income_ranges
                .entry(income_bucket(p.applicant_income).to_string())
                .or_default() += 1;
        }

        if stats.total_applications > 0 {
            let n = stats.total_applications as f64;
            stats.avg_applicant_income = applicant_sum / n;
            stats.avg_coapplicant_income = coapplicant_sum / n;
        }
        if amount_n > 0 {
            stats.avg_loan_amount = amount_sum / amount_n as f64;
        }
        stats.approval_rate = approval_rate(stats.approved_loans, stats.total_applications);
        stats
    }
}

/// Approved share of all applications as a percentage (0 when empty).
pub fn approval_rate(approved: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(approved as f64 / total as f64 * 100.0)
}

/// Snapshot about to be stored; the store assigns `analytics_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub analysis_date: DateTime<Utc>,
    pub statistics: ApplicationStatistics,
}

impl NewSnapshot {
    pub fn with_id(self, analytics_id: i64, created_at: DateTime<Utc>) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            analytics_id,
            analysis_date: self.analysis_date,
            statistics: self.statistics,
            created_at,
        }
    }
}

/// Immutable stored aggregate. Superseded by later snapshots, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub analytics_id: i64,
    pub analysis_date: DateTime<Utc>,
    #[serde(flatten)]
    pub statistics: ApplicationStatistics,
    pub created_at: DateTime<Utc>,
}

impl AnalyticsSnapshot {
    /// Backend-independent identity used by reconciliation checks.
    pub fn identity_key(&self) -> String {
        super::format_timestamp(&self.analysis_date)
    }
}
