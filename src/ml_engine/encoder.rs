//! Feature encoding: application attributes → fixed-order numeric vector
//!
//! The same encoder runs at training time and at inference time. Any change
//! to the arithmetic here silently invalidates every trained artifact, so the
//! layout is pinned by [`FEATURE_NAMES`](crate::types::FEATURE_NAMES) and the
//! artifact loader refuses models trained on a different list.

use crate::types::{
    ApplicantProfile, Education, FeatureVector, Gender, Married, RawApplication, SelfEmployed,
    ValidationError,
};

/// Term assumed when an application has no loan term, in months.
pub const DEFAULT_LOAN_TERM_MONTHS: f64 = 360.0;

/// Stateless encoder. Construct freely; it carries no data.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEncoder;

impl FeatureEncoder {
    /// Validate free-text categoricals, then encode.
    pub fn encode(raw: &RawApplication) -> Result<FeatureVector, ValidationError> {
        let profile = ApplicantProfile::try_from(raw)?;
        Ok(Self::encode_profile(&profile))
    }

    /// Encode an already-validated profile. Never fails.
    pub fn encode_profile(p: &ApplicantProfile) -> FeatureVector {
        let loan_amount = p.loan_amount.unwrap_or(0.0);
        let term = p.loan_amount_term.map(f64::from);
        let total_income = p.applicant_income + p.coapplicant_income;

        let income_to_loan_ratio = if loan_amount > 0.0 {
            total_income / loan_amount
        } else {
            0.0
        };
        // No payment without both an amount and an explicit term
        let monthly_payment = match term {
            Some(months) if months > 0.0 && loan_amount > 0.0 => loan_amount / months,
            _ => 0.0,
        };

        FeatureVector {
            gender_male: flag(p.gender == Gender::Male),
            married_yes: flag(p.married == Married::Yes),
            education_graduate: flag(p.education == Education::Graduate),
            self_employed_yes: flag(p.self_employed == SelfEmployed::Yes),
            credit_history: p.credit_history.map_or(0.0, f64::from),
            dependents_count: f64::from(p.dependents.count()),
            property_area_code: f64::from(p.property_area.code()),
            applicant_income: p.applicant_income,
            coapplicant_income: p.coapplicant_income,
            loan_amount,
            loan_amount_term: term.unwrap_or(DEFAULT_LOAN_TERM_MONTHS),
            total_income,
            income_to_loan_ratio,
            monthly_payment,
        }
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}
