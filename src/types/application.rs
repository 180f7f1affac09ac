//! Loan application types: categorical domains, applicant profile, create and patch payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::validation::{non_negative, ValidationError};

/// Maximum length of a loan identifier.
pub const LOAN_ID_MAX_LEN: usize = 20;

// ============================================================================
// Categorical domains
// ============================================================================

/// Declares a closed categorical domain with its wire labels.
///
/// Every label is the exact string stored in both backends and accepted from
/// clients; parsing is case-sensitive so encoding stays reproducible.
macro_rules! categorical {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $label)]
                $variant,
            )+
        }

        impl $name {
            /// Wire labels in declaration order.
            pub const LABELS: &'static [&'static str] = &[$($label),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }

            /// Parse a wire label, rejecting anything outside the domain.
            pub fn parse(value: &str) -> Result<Self, ValidationError> {
                match value {
                    $($label => Ok($name::$variant),)+
                    other => Err(ValidationError::out_of_domain($field, other, Self::LABELS)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

categorical!(
    /// Applicant gender
    Gender, "gender" { Male => "Male", Female => "Female" }
);

categorical!(
    /// Marital status
    Married, "married" { Yes => "Yes", No => "No" }
);

categorical!(
    /// Dependents count category (`3+` collapses everything above two)
    Dependents, "dependents" { Zero => "0", One => "1", Two => "2", ThreePlus => "3+" }
);

categorical!(
    /// Education level
    Education, "education" { Graduate => "Graduate", NotGraduate => "Not Graduate" }
);

categorical!(
    /// Self-employment flag
    SelfEmployed, "self_employed" { Yes => "Yes", No => "No" }
);

categorical!(
    /// Property area category
    PropertyArea, "property_area" { Urban => "Urban", Semiurban => "Semiurban", Rural => "Rural" }
);

categorical!(
    /// Adjudicated outcome label
    LoanStatus, "loan_status" { Approved => "Y", Rejected => "N" }
);

impl Dependents {
    /// Numeric count used by the feature encoder (`3+` → 3).
    pub fn count(&self) -> u8 {
        match self {
            Dependents::Zero => 0,
            Dependents::One => 1,
            Dependents::Two => 2,
            Dependents::ThreePlus => 3,
        }
    }
}

impl PropertyArea {
    /// Ordinal code used by the feature encoder.
    pub fn code(&self) -> u8 {
        match self {
            PropertyArea::Urban => 0,
            PropertyArea::Semiurban => 1,
            PropertyArea::Rural => 2,
        }
    }
}

// ============================================================================
// Applicant profile
// ============================================================================

/// Every attribute of an application except identity, label and timestamps.
///
/// This is the exact input of the feature encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantProfile {
    pub gender: Gender,
    pub married: Married,
    pub dependents: Dependents,
    pub education: Education,
    pub self_employed: SelfEmployed,
    pub applicant_income: f64,
    pub coapplicant_income: f64,
    #[serde(default)]
    pub loan_amount: Option<f64>,
    /// Loan term in months
    #[serde(default)]
    pub loan_amount_term: Option<u32>,
    /// 1 = meets credit guidelines, 0 = does not
    #[serde(default)]
    pub credit_history: Option<u8>,
    pub property_area: PropertyArea,
}

impl ApplicantProfile {
    /// Check numeric invariants. Categoricals are already enforced by type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        non_negative("applicant_income", self.applicant_income)?;
        non_negative("coapplicant_income", self.coapplicant_income)?;
        if let Some(amount) = self.loan_amount {
            non_negative("loan_amount", amount)?;
        }
        if self.loan_amount_term == Some(0) {
            return Err(ValidationError::new("loan_amount_term", "must be > 0 months"));
        }
        if let Some(flag) = self.credit_history {
            if flag > 1 {
                return Err(ValidationError::new("credit_history", "must be 0 or 1"));
            }
        }
        Ok(())
    }

    pub fn total_income(&self) -> f64 {
        self.applicant_income + self.coapplicant_income
    }
}

/// Check the immutable identity key.
pub fn validate_loan_id(loan_id: &str) -> Result<(), ValidationError> {
    if loan_id.is_empty() || loan_id.len() > LOAN_ID_MAX_LEN {
        return Err(ValidationError::new(
            "loan_id",
            format!("must be 1..={LOAN_ID_MAX_LEN} characters"),
        ));
    }
    if !loan_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValidationError::new(
            "loan_id",
            "may only contain ASCII letters, digits, '_', '-' and '.'",
        ));
    }
    Ok(())
}

// ============================================================================
// Stored application
// ============================================================================

/// A loan application as persisted in either backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanApplication {
    pub loan_id: String,
    #[serde(flatten)]
    pub profile: ApplicantProfile,
    #[serde(default)]
    pub loan_status: Option<LoanStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated create payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NewApplication {
    pub loan_id: String,
    pub profile: ApplicantProfile,
    pub loan_status: Option<LoanStatus>,
}

impl NewApplication {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_loan_id(&self.loan_id)?;
        self.profile.validate()
    }

    /// Stamp creation and update times.
    pub fn into_application(self, now: DateTime<Utc>) -> LoanApplication {
        LoanApplication {
            loan_id: self.loan_id,
            profile: self.profile,
            loan_status: self.loan_status,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Raw (unvalidated) payloads
// ============================================================================

/// Application-shaped input with categoricals still as free text.
///
/// Used wherever data arrives from outside the type system (HTTP bodies,
/// import files) so that domain violations surface as [`ValidationError`]s
/// naming the offending field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawApplication {
    pub gender: String,
    pub married: String,
    pub dependents: String,
    pub education: String,
    pub self_employed: String,
    pub applicant_income: f64,
    pub coapplicant_income: f64,
    #[serde(default)]
    pub loan_amount: Option<f64>,
    #[serde(default)]
    pub loan_amount_term: Option<i64>,
    #[serde(default)]
    pub credit_history: Option<i64>,
    pub property_area: String,
}

impl TryFrom<&RawApplication> for ApplicantProfile {
    type Error = ValidationError;

    fn try_from(raw: &RawApplication) -> Result<Self, Self::Error> {
        let loan_amount_term = raw
            .loan_amount_term
            .map(|term| {
                u32::try_from(term)
                    .ok()
                    .filter(|t| *t > 0)
                    .ok_or_else(|| ValidationError::new("loan_amount_term", "must be > 0 months"))
            })
            .transpose()?;
        let credit_history = raw
            .credit_history
            .map(|flag| match flag {
                0 => Ok(0u8),
                1 => Ok(1u8),
                _ => Err(ValidationError::new("credit_history", "must be 0 or 1")),
            })
            .transpose()?;

        let profile = ApplicantProfile {
            gender: Gender::parse(&raw.gender)?,
            married: Married::parse(&raw.married)?,
            dependents: Dependents::parse(&raw.dependents)?,
            education: Education::parse(&raw.education)?,
            self_employed: SelfEmployed::parse(&raw.self_employed)?,
            applicant_income: raw.applicant_income,
            coapplicant_income: raw.coapplicant_income,
            loan_amount: raw.loan_amount,
            loan_amount_term,
            credit_history,
            property_area: PropertyArea::parse(&raw.property_area)?,
        };
        profile.validate()?;
        Ok(profile)
    }
}

impl From<&ApplicantProfile> for RawApplication {
    fn from(profile: &ApplicantProfile) -> Self {
        Self {
            gender: profile.gender.to_string(),
            married: profile.married.to_string(),
            dependents: profile.dependents.to_string(),
            education: profile.education.to_string(),
            self_employed: profile.self_employed.to_string(),
            applicant_income: profile.applicant_income,
            coapplicant_income: profile.coapplicant_income,
            loan_amount: profile.loan_amount,
            loan_amount_term: profile.loan_amount_term.map(i64::from),
            credit_history: profile.credit_history.map(i64::from),
            property_area: profile.property_area.to_string(),
        }
    }
}

/// Body of a create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplicationRequest {
    pub loan_id: String,
    #[serde(flatten)]
    pub application: RawApplication,
    #[serde(default)]
    pub loan_status: Option<String>,
}

impl NewApplicationRequest {
    pub fn validate(self) -> Result<NewApplication, ValidationError> {
        validate_loan_id(&self.loan_id)?;
        let profile = ApplicantProfile::try_from(&self.application)?;
        let loan_status = self
            .loan_status
            .as_deref()
            .map(LoanStatus::parse)
            .transpose()?;
        Ok(NewApplication {
            loan_id: self.loan_id,
            profile,
            loan_status,
        })
    }
}

// ============================================================================
// Partial update
// ============================================================================

/// Partial update: only supplied fields change.
///
/// The field list is the whitelist of updatable attributes; unknown keys
/// (including the immutable `loan_id`) are rejected at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub married: Option<Married>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependents: Option<Dependents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub education: Option<Education>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_employed: Option<SelfEmployed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicant_income: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coapplicant_income: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_amount_term: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_history: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_area: Option<PropertyArea>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_status: Option<LoanStatus>,
}

impl ApplicationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply supplied fields to `app`, re-validate, and bump `updated_at`.
    ///
    /// On error `app` is left untouched.
    pub fn apply(&self, app: &mut LoanApplication, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let mut profile = app.profile.clone();

        if let Some(v) = self.gender {
            profile.gender = v;
        }
        if let Some(v) = self.married {
            profile.married = v;
        }
        if let Some(v) = self.dependents {
            profile.dependents = v;
        }
        if let Some(v) = self.education {
            profile.education = v;
        }
        if let Some(v) = self.self_employed {
            profile.self_employed = v;
        }
        if let Some(v) = self.applicant_income {
            profile.applicant_income = v;
        }
        if let Some(v) = self.coapplicant_income {
            profile.coapplicant_income = v;
        }
        if let Some(v) = self.loan_amount {
            profile.loan_amount = Some(v);
        }
        if let Some(v) = self.loan_amount_term {
            profile.loan_amount_term = Some(v);
        }
        if let Some(v) = self.credit_history {
            profile.credit_history = Some(v);
        }
        if let Some(v) = self.property_area {
            profile.property_area = v;
        }

        profile.validate()?;

        app.profile = profile;
        if let Some(status) = self.loan_status {
            app.loan_status = Some(status);
        }
        app.updated_at = now;
        Ok(())
    }
}
