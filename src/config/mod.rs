//! Application configuration
//!
//! ## Loading Order
//!
//! 1. `LOAN_PIPELINE_CONFIG` environment variable (path to TOML file)
//! 2. `loan_pipeline.toml` in the current working directory
//! 3. Built-in defaults
//!
//! Environment overrides (`DATABASE_URL`, `DOCUMENT_STORE_PATH`, `MODEL_PATH`,
//! `BIND_ADDRESS`) are applied on top, and CLI flags on top of those.
//!
//! There is no global instance: `main` builds one `AppConfig` and hands the
//! relevant sections to the components that need them.

mod app_config;
pub mod defaults;

pub use app_config::*;
