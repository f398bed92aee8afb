// ABOUTME: Public error taxonomy for the persistence layer.
// ABOUTME: Every substrate failure is classified into one of these closed variants.

use thiserror::Error;

/// Classified persistence errors surfaced to callers.
///
/// The taxonomy is closed: whatever the substrate reports, classification
/// always lands on one of these variants and never propagates an
/// unclassified exception. Each variant carries a generated message and,
/// where one exists, the underlying cause for diagnostics.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The substrate's capacity ceiling is exhausted. Callers should prune
    /// or reject further writes.
    #[error("storage quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The host denies storage access entirely (e.g. privacy mode).
    /// Callers should degrade to in-memory-only operation or no-op.
    #[error("storage disabled: {message}")]
    StorageDisabled {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization or parse failure, or any substrate failure that does
    /// not classify more specifically.
    #[error("invalid data: {message}")]
    InvalidData {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Declared in the taxonomy but never raised today: the read path only
    /// logs on a version-tag mismatch and still returns the value. Whether
    /// migration logic was ever intended remains an open gap; no migration
    /// is performed.
    #[error("version mismatch: {message}")]
    VersionMismatch { message: String },
}

impl StoreError {
    /// The classified code, stable across message wording changes.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            StoreError::StorageDisabled { .. } => "STORAGE_DISABLED",
            StoreError::InvalidData { .. } => "INVALID_DATA",
            StoreError::VersionMismatch { .. } => "VERSION_MISMATCH",
        }
    }

    pub fn invalid_data(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        StoreError::InvalidData {
            message: message.into(),
            source,
        }
    }
}
