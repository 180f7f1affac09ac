//! Store error taxonomy
//!
//! Driver errors (`sqlx`, `sled`, `serde_json`) are translated here and never
//! cross the `RecordStore` boundary.

use crate::types::ValidationError;

use super::Backend;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} '{key}' already exists")]
    DuplicateKey { entity: &'static str, key: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{backend} store unavailable: {message}")]
    Unavailable { backend: Backend, message: String },

    #[error("corrupt {entity} record in {backend} store: {message}")]
    Corrupt {
        backend: Backend,
        entity: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn duplicate(entity: &'static str, key: impl ToString) -> Self {
        Self::DuplicateKey {
            entity,
            key: key.to_string(),
        }
    }

    pub fn unavailable(backend: Backend, message: impl ToString) -> Self {
        Self::Unavailable {
            backend,
            message: message.to_string(),
        }
    }

    pub fn corrupt(backend: Backend, entity: &'static str, message: impl ToString) -> Self {
        Self::Corrupt {
            backend,
            entity,
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Map a sqlx error raised while touching `entity` identified by `key`.
    pub(crate) fn from_sqlx(err: sqlx::Error, entity: &'static str, key: &str) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found(entity, key),
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    Self::duplicate(entity, key)
                } else if db.is_foreign_key_violation() {
                    Self::not_found(super::EntityKind::Applications.record_name(), key)
                } else if db.is_check_violation() {
                    Self::Validation(ValidationError::new(entity, db.message().to_string()))
                } else {
                    Self::unavailable(Backend::Relational, db)
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => Self::corrupt(Backend::Relational, entity, err),
            other => Self::unavailable(Backend::Relational, other),
        }
    }

    pub(crate) fn from_sled(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => {
                Self::corrupt(Backend::Document, "document", err)
            }
            other => Self::unavailable(Backend::Document, other),
        }
    }
}
