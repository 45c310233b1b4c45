use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur within the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No record matches the lookup key.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A unit of work with the same natural key already exists.
    #[error("Duplicate unit of work {process_name}@{timeperiod} [{start_id}, {end_id})")]
    DuplicateKey {
        process_name: String,
        timeperiod: String,
        start_id: String,
        end_id: String,
    },

    /// A data source was asked for markers over a window it cannot read.
    #[error("Invalid range bounds: {0}")]
    InvalidBounds(#[from] tempo_core::CoreError),

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Connectivity faults worth retrying: a locked or busy database file,
    /// or one that could not be opened.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
