//! Shared data structures for the loan pipeline
//!
//! - `application`: loan applications, categorical domains, create/patch payloads
//! - `features`: the fixed-order numeric feature vector consumed by the model
//! - `prediction`: inference results and stored prediction history
//! - `analytics`: aggregate statistics and immutable snapshots
//! - `validation`: field-level validation errors

mod analytics;
mod application;
mod features;
mod prediction;
mod validation;

pub use analytics::*;
pub use application::*;
pub use features::*;
pub use prediction::*;
pub use validation::ValidationError;

use chrono::{DateTime, SubsecRound, Utc};

/// Fixed-width UTC timestamp layout shared by both backends.
///
/// Lexicographic order equals chronological order, which the relational
/// backend relies on for `ORDER BY`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Current time truncated to microseconds, the precision both backends keep.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}
