//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Configuration discovery
// ============================================================================

/// Environment variable naming the TOML config file.
pub const CONFIG_ENV_VAR: &str = "LOAN_PIPELINE_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "loan_pipeline.toml";

// ============================================================================
// Server
// ============================================================================

pub const BIND_ADDRESS: &str = "0.0.0.0:8000";

/// Request body limit (bytes).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// `GET /loans/` page size when `limit` is omitted, and its upper bound.
pub const LIST_LIMIT: u32 = 100;
pub const LIST_LIMIT_MAX: u32 = 1000;

/// `GET /loans/search/` page size when `limit` is omitted, and its upper bound.
pub const SEARCH_LIMIT: u32 = 10;
pub const SEARCH_LIMIT_MAX: u32 = 100;

/// Document-store view page size and its upper bound.
pub const DOCUMENT_VIEW_LIMIT: u32 = 100;
pub const DOCUMENT_VIEW_LIMIT_MAX: u32 = 1000;

// ============================================================================
// Storage
// ============================================================================

pub const DATABASE_URL: &str = "sqlite:data/loan_pipeline.db?mode=rwc";

pub const MAX_CONNECTIONS: u32 = 5;

pub const DOCUMENT_PATH: &str = "data/documents";

// ============================================================================
// Model
// ============================================================================

pub const MODEL_PATH: &str = "ml/loan_prediction_model.json";

/// Seed for the train/test shuffle.
pub const TRAINING_SEED: u64 = 42;

/// Held-out share of labelled rows.
pub const TEST_FRACTION: f64 = 0.25;

pub const MAX_ITERATIONS: usize = 1000;

pub const LEARNING_RATE: f64 = 0.1;

// ============================================================================
// Sync
// ============================================================================

/// Periodic reconciliation interval (seconds). 0 disables the job.
pub const SYNC_INTERVAL_SECS: u64 = 0;
