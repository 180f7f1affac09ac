//! Numeric model input derived from an application

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of features in a [`FeatureVector`].
pub const NUM_FEATURES: usize = 14;

/// Feature names in model input order.
///
/// A model artifact's `feature_names` must equal this list exactly.
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "gender_male",
    "married_yes",
    "education_graduate",
    "self_employed_yes",
    "credit_history",
    "dependents_count",
    "property_area_code",
    "applicant_income",
    "coapplicant_income",
    "loan_amount",
    "loan_amount_term",
    "total_income",
    "income_to_loan_ratio",
    "monthly_payment",
];

/// Encoded features, one named field per model input.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub gender_male: f64,
    pub married_yes: f64,
    pub education_graduate: f64,
    pub self_employed_yes: f64,
    pub credit_history: f64,
    pub dependents_count: f64,
    pub property_area_code: f64,
    pub applicant_income: f64,
    pub coapplicant_income: f64,
    pub loan_amount: f64,
    pub loan_amount_term: f64,
    pub total_income: f64,
    pub income_to_loan_ratio: f64,
    pub monthly_payment: f64,
}

impl FeatureVector {
    /// Values in [`FEATURE_NAMES`] order.
    pub fn to_array(&self) -> [f64; NUM_FEATURES] {
        [
            self.gender_male,
            self.married_yes,
            self.education_graduate,
            self.self_employed_yes,
            self.credit_history,
            self.dependents_count,
            self.property_area_code,
            self.applicant_income,
            self.coapplicant_income,
            self.loan_amount,
            self.loan_amount_term,
            self.total_income,
            self.income_to_loan_ratio,
            self.monthly_payment,
        ]
    }

    pub fn from_array(values: [f64; NUM_FEATURES]) -> Self {
        let [gender_male, married_yes, education_graduate, self_employed_yes, credit_history, dependents_count, property_area_code, applicant_income, coapplicant_income, loan_amount, loan_amount_term, total_income, income_to_loan_ratio, monthly_payment] =
            values;
        Self {
            gender_male,
            married_yes,
            education_graduate,
            self_employed_yes,
            credit_history,
            dependents_count,
            property_area_code,
            applicant_income,
            coapplicant_income,
            loan_amount,
            loan_amount_term,
            total_income,
            income_to_loan_ratio,
            monthly_payment,
        }
    }

    /// `(name, value)` pairs in model input order.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> {
        FEATURE_NAMES.into_iter().zip(self.to_array())
    }
}

/// Stored features for one application (at most one per loan).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub loan_id: String,
    #[serde(flatten)]
    pub features: FeatureVector,
    pub derived_at: DateTime<Utc>,
}
