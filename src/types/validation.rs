//! Field-level validation errors shared by every entity type

use serde::Serialize;

/// Client-supplied data violated a field constraint or an enum domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Value outside an enumerated domain, e.g. `gender = "Other"`.
    pub fn out_of_domain(field: &str, value: &str, allowed: &[&str]) -> Self {
        Self::new(
            field,
            format!("'{}' is not one of [{}]", value, allowed.join(", ")),
        )
    }
}

/// Require a finite, non-negative amount.
pub(crate) fn non_negative(field: &str, value: f64) -> Result<f64, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::new(field, "must be a finite number"));
    }
    if value < 0.0 {
        return Err(ValidationError::new(field, format!("must be >= 0 (got {value})")));
    }
    Ok(value)
}

/// Require a probability-like value in [0, 1].
pub(crate) fn unit_interval(field: &str, value: f64) -> Result<f64, ValidationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::new(field, format!("must be within [0, 1] (got {value})")));
    }
    Ok(value)
}
