use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::defaults;
use crate::storage::EntityKind;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Maximum request body size in bytes
    pub max_payload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::BIND_ADDRESS.to_string(),
            max_payload_size: defaults::MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx connection URL of the relational store
    pub database_url: String,
    pub max_connections: u32,
    /// Directory of the sled document store
    pub document_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            max_connections: defaults::MAX_CONNECTIONS,
            document_path: PathBuf::from(defaults::DOCUMENT_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub artifact_path: PathBuf,
    pub training_seed: u64,
    pub test_fraction: f64,
    pub max_iterations: usize,
    pub learning_rate: f64,
    pub l2_penalty: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from(defaults::MODEL_PATH),
            training_seed: defaults::TRAINING_SEED,
            test_fraction: defaults::TEST_FRACTION,
            max_iterations: defaults::MAX_ITERATIONS,
            learning_rate: defaults::LEARNING_RATE,
            l2_penalty: 0.0,
        }
    }
}

/// Which backend is authoritative during reconciliation.
///
/// API writes commit to the relational store first, so it is the default
/// source. `Document` replaces primary data with the mirror's and is meant
/// for one-off restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Document,
    #[default]
    Relational,
}

impl std::fmt::Display for SyncSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncSource::Document => "document",
            SyncSource::Relational => "relational",
        })
    }
}

/// How API writes reach the two backends.
///
/// Neither mode is atomic across backends: under `WriteThrough` the mirror
/// write follows the primary commit and may fail on its own; under
/// `PrimaryOnly` the mirror is stale until the next reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    WriteThrough,
    PrimaryOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub source: SyncSource,
    pub write_mode: WriteMode,
    /// 0 disables periodic reconciliation
    pub interval_secs: u64,
    /// Kinds reconciled by the periodic job, in order
    pub entities: Vec<EntityKind>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: SyncSource::default(),
            write_mode: WriteMode::default(),
            interval_secs: defaults::SYNC_INTERVAL_SECS,
            entities: EntityKind::DERIVED.to_vec(),
        }
    }
}

// ============================================================================
// AppConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error ({}): {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

impl AppConfig {
    /// Load using the standard search order, then apply environment overrides.
    ///
    /// A broken file is logged and skipped rather than aborting startup.
    pub fn load() -> Self {
        let mut config = Self::discover();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn discover() -> Self {
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", defaults::CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", defaults::CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(defaults::LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(path = %local.display(), "Loaded config from working directory");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", defaults::LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No config file found, using built-in defaults");
        Self::default()
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(path) = lookup("DOCUMENT_STORE_PATH") {
            self.storage.document_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("MODEL_PATH") {
            self.model.artifact_path = PathBuf::from(path);
        }
        if let Some(addr) = lookup("BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
    }

    /// Check every section, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.bind_address.trim().is_empty() {
            errors.push("server.bind_address must not be empty".to_string());
        }
        if self.server.max_payload_size == 0 {
            errors.push("server.max_payload_size must be > 0".to_string());
        }
        if self.storage.database_url.trim().is_empty() {
            errors.push("storage.database_url must not be empty".to_string());
        }
        if self.storage.max_connections == 0 {
            errors.push("storage.max_connections must be > 0".to_string());
        }
        if self.storage.document_path.as_os_str().is_empty() {
            errors.push("storage.document_path must not be empty".to_string());
        }
        if self.model.artifact_path.as_os_str().is_empty() {
            errors.push("model.artifact_path must not be empty".to_string());
        }
        if !(self.model.test_fraction > 0.0 && self.model.test_fraction < 1.0) {
            errors.push(format!(
                "model.test_fraction ({}) must be within (0, 1)",
                self.model.test_fraction
            ));
        }
        if !(self.model.learning_rate > 0.0) {
            errors.push(format!(
                "model.learning_rate ({}) must be > 0",
                self.model.learning_rate
            ));
        }
        if self.model.l2_penalty < 0.0 {
            errors.push("model.l2_penalty must be >= 0".to_string());
        }
        if self.model.max_iterations == 0 {
            errors.push("model.max_iterations must be > 0".to_string());
        }

        if self.sync.write_mode == WriteMode::WriteThrough && self.sync.source == SyncSource::Document {
            errors.push(
                "sync.source = document with sync.write_mode = write_through: \
                 reconciliation would delete primary writes the mirror missed"
                    .to_string(),
            );
        } else if self.sync.source == SyncSource::Document {
            warn!(
                "sync.write_mode = primary_only with sync.source = document: \
                 the next reconciliation will overwrite relational-only writes"
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}
