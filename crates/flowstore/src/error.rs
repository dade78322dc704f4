//! Error types for flowstore
//!
//! Two layers:
//! - `StoreError`: the internal taxonomy every component returns
//! - `StorageAlert`: the user-facing shape broadcast when a write could not be
//!   made durable, with stable codes for UI handling and retry hints

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::security::SecretError;

/// Failure of the underlying store primitive (read, write, remove).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Injected fault: {0}")]
    Injected(String),
}

/// Errors produced by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Stored tag does not match the stored data. The payload is untrusted.
    #[error("Integrity violation for key '{key}'")]
    IntegrityViolation { key: String },

    /// Value cannot be canonically encoded; refused before any I/O.
    #[error("Value for key '{key}' is not serializable: {reason}")]
    SerializationFailure { key: String, reason: String },

    /// Every backoff attempt failed.
    #[error("Storage operation '{operation}' failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Read-back after a critical write did not match what was written.
    #[error("Write verification failed for keys: {}", keys.join(", "))]
    VerificationFailure { keys: Vec<String> },

    /// Structural shape violation for a known collection.
    #[error("Corruption detected in '{collection}': {reason}")]
    CorruptionDetected { collection: String, reason: String },

    /// A registered migration step failed or the persisted version is unknown.
    #[error("Migration '{version}' failed: {reason}")]
    MigrationFailure { version: String, reason: String },

    /// A newer save for the same store and key replaced this one.
    #[error("Save for '{store_id}/{key}' superseded by a newer request")]
    Superseded { store_id: String, key: String },

    /// The pending save was cancelled before it ran.
    #[error("Save for '{store_id}/{key}' cancelled")]
    Cancelled { store_id: String, key: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl StoreError {
    /// Stable machine-readable kind, used in audit records and alerts
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IntegrityViolation { .. } => "integrity_violation",
            Self::SerializationFailure { .. } => "serialization_failure",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::VerificationFailure { .. } => "verification_failure",
            Self::CorruptionDetected { .. } => "corruption_detected",
            Self::MigrationFailure { .. } => "migration_failure",
            Self::Superseded { .. } => "superseded",
            Self::Cancelled { .. } => "cancelled",
            Self::Config(_) => "config",
            Self::Secret(_) => "secret",
            Self::Backend(_) => "backend",
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }

    /// Whether this error means a write did not take effect
    pub fn is_write_failure(&self) -> bool {
        matches!(
            self,
            Self::ExhaustedRetries { .. } | Self::VerificationFailure { .. }
        )
    }
}

/// Alert categories for grouping in the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    /// A save did not become durable
    Write,
    /// Stored data failed verification
    Integrity,
    /// Stored structure was damaged
    Corruption,
    /// Startup migration problem
    Migration,
    /// Anything else
    Internal,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => write!(f, "write"),
            Self::Integrity => write!(f, "integrity"),
            Self::Corruption => write!(f, "corruption"),
            Self::Migration => write!(f, "migration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Stable alert codes for frontend handling
/// Format: CATEGORY_SPECIFIC_ERROR
pub struct AlertCode;

impl AlertCode {
    pub const STORAGE_WRITE_FAILED: &'static str = "STORAGE_WRITE_FAILED";
    pub const STORAGE_VERIFICATION_FAILED: &'static str = "STORAGE_VERIFICATION_FAILED";
    pub const STORAGE_ROLLBACK_FAILED: &'static str = "STORAGE_ROLLBACK_FAILED";
    pub const STORAGE_SERIALIZATION_FAILED: &'static str = "STORAGE_SERIALIZATION_FAILED";
    pub const INTEGRITY_VIOLATION: &'static str = "INTEGRITY_VIOLATION";
    pub const CORRUPTION_DETECTED: &'static str = "CORRUPTION_DETECTED";
    pub const MIGRATION_FAILED: &'static str = "MIGRATION_FAILED";
    pub const INTERNAL_ERROR: &'static str = "INTERNAL_ERROR";
}

/// User-facing alert raised when persisted state may not match what the user sees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAlert {
    /// Stable alert code for frontend handling
    pub code: String,
    /// User-friendly message
    pub message: String,
    /// Optional internal details for logging (not shown to user)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether retrying the operation may help
    pub retryable: bool,
    pub category: AlertCategory,
    /// Storage keys the alert concerns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

impl StorageAlert {
    pub fn new(code: impl Into<String>, message: impl Into<String>, category: AlertCategory) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            retryable: false,
            category,
            keys: Vec::new(),
        }
    }

    /// Add internal detail for logging
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    /// Mark as retryable
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Alert for a save that failed and was rolled back
    pub fn write_failed(detail: impl Into<String>) -> Self {
        Self::new(
            AlertCode::STORAGE_WRITE_FAILED,
            "Your latest changes could not be saved. Please try again, or restart the application if the problem persists.",
            AlertCategory::Write,
        )
        .with_detail(detail)
        .retryable()
    }

    /// Alert for a save whose read-back did not match
    pub fn verification_failed(detail: impl Into<String>) -> Self {
        Self::new(
            AlertCode::STORAGE_VERIFICATION_FAILED,
            "Saved data could not be verified and the previous version was restored. Please try again, or restart the application.",
            AlertCategory::Write,
        )
        .with_detail(detail)
        .retryable()
    }

    /// Alert for a rollback that could not restore the previous data
    pub fn rollback_failed(detail: impl Into<String>) -> Self {
        Self::new(
            AlertCode::STORAGE_ROLLBACK_FAILED,
            "Previous data could not be restored after a failed save. Restart the application before making further changes.",
            AlertCategory::Write,
        )
        .with_detail(detail)
    }
}

impl From<&StoreError> for StorageAlert {
    fn from(e: &StoreError) -> Self {
        match e {
            StoreError::ExhaustedRetries { .. } | StoreError::Backend(_) => {
                Self::write_failed(e.to_string())
            }
            StoreError::VerificationFailure { keys } => {
                Self::verification_failed(e.to_string()).with_keys(keys.clone())
            }
            StoreError::SerializationFailure { key, .. } => Self::new(
                AlertCode::STORAGE_SERIALIZATION_FAILED,
                "Data could not be prepared for saving",
                AlertCategory::Write,
            )
            .with_detail(e.to_string())
            .with_keys(vec![key.clone()]),
            StoreError::IntegrityViolation { key } => Self::new(
                AlertCode::INTEGRITY_VIOLATION,
                "Stored data failed verification and was ignored",
                AlertCategory::Integrity,
            )
            .with_keys(vec![key.clone()]),
            StoreError::CorruptionDetected { collection, .. } => Self::new(
                AlertCode::CORRUPTION_DETECTED,
                "Stored data is damaged and could not be repaired automatically",
                AlertCategory::Corruption,
            )
            .with_detail(e.to_string())
            .with_keys(vec![collection.clone()]),
            StoreError::MigrationFailure { .. } => Self::new(
                AlertCode::MIGRATION_FAILED,
                "Stored data could not be upgraded to the current version",
                AlertCategory::Migration,
            )
            .with_detail(e.to_string()),
            _ => Self::new(
                AlertCode::INTERNAL_ERROR,
                "An internal storage error occurred",
                AlertCategory::Internal,
            )
            .with_detail(e.to_string()),
        }
    }
}

impl fmt::Display for StorageAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
