// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for drover-core.
//!
//! Every store, engine and manager operation reports failures through
//! [`CoreError`]. Each variant carries a stable machine-readable code
//! (see [`CoreError::error_code`]) that is attached to structured log lines.

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while managing orchestration instances.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Instance was not found in the store.
    #[error("Instance '{instance_id}' not found")]
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Instance already exists (duplicate start or redelivered message).
    #[error("Instance '{instance_id}' already exists")]
    InstanceAlreadyExists {
        /// The instance ID that already exists.
        instance_id: String,
    },

    /// Instance is in an invalid state for the requested operation.
    #[error("Instance '{instance_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidInstanceState {
        /// The instance ID.
        instance_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// An append would break the gap-free ordering of the history.
    #[error("History conflict for instance '{instance_id}' at index {sequence_index}: {reason}")]
    HistoryConflict {
        /// The instance ID.
        instance_id: String,
        /// The rejected sequence index.
        sequence_index: u32,
        /// Why the append was rejected.
        reason: String,
    },

    /// No history event exists at the given index.
    #[error("History event {sequence_index} not found for instance '{instance_id}'")]
    EventNotFound {
        /// The instance ID.
        instance_id: String,
        /// The missing sequence index.
        sequence_index: u32,
    },

    /// The history event already carries a result.
    #[error("Result already recorded for instance '{instance_id}' at index {sequence_index}")]
    ResultAlreadyRecorded {
        /// The instance ID.
        instance_id: String,
        /// The sequence index that was already completed.
        sequence_index: u32,
    },

    /// No orchestration is registered under the given name.
    #[error("Orchestration '{name}' is not registered")]
    UnknownOrchestration {
        /// The requested orchestration name.
        name: String,
    },

    /// Waiting for an instance to reach a terminal state timed out.
    #[error("Timed out after {waited_ms}ms waiting for instance '{instance_id}'")]
    Timeout {
        /// The instance ID.
        instance_id: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

const JSON_OPERATION: &str = "json";

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceAlreadyExists { .. } => "INSTANCE_ALREADY_EXISTS",
            Self::InvalidInstanceState { .. } => "INVALID_INSTANCE_STATE",
            Self::HistoryConflict { .. } => "HISTORY_CONFLICT",
            Self::EventNotFound { .. } => "EVENT_NOT_FOUND",
            Self::ResultAlreadyRecorded { .. } => "RESULT_ALREADY_RECORDED",
            Self::UnknownOrchestration { .. } => "UNKNOWN_ORCHESTRATION",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Payload encoding errors are permanent: the same bytes fail again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { operation, .. } if operation != JSON_OPERATION)
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(instance_id: &str) -> Self {
        Self::InstanceNotFound {
            instance_id: instance_id.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: JSON_OPERATION.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
