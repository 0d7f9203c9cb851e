// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for drover-core.
//!
//! The [`DurableStore`] trait is the only shared mutable resource in the
//! system. Backends:
//!
//! - [`InMemoryStore`]: process-local, for tests and embedding
//! - [`SqliteStore`]: durable, with embedded migrations

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{ActivityResult, HistoryEvent, InstanceRecord, InstanceStatus};

/// Durable storage for orchestration instances and their history.
///
/// Every write is atomic with respect to a single instance.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Persist a new Pending instance.
    ///
    /// Fails with [`CoreError::InstanceAlreadyExists`] if the ID is taken.
    async fn create_instance(
        &self,
        instance_id: &str,
        orchestrator_name: &str,
        input: &Value,
    ) -> Result<(), CoreError>;

    /// Fetch an instance by ID.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    /// Load the full history ordered by `sequence_index`.
    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, CoreError>;

    /// Append a scheduled event.
    ///
    /// The event's index must equal the current history length and it must
    /// not carry a result yet. Terminal instances accept no new events.
    async fn append_event(&self, instance_id: &str, event: &HistoryEvent) -> Result<(), CoreError>;

    /// Record the result of the event at `sequence_index`.
    ///
    /// A result is written at most once; a second completion fails with
    /// [`CoreError::ResultAlreadyRecorded`].
    async fn complete_event(
        &self,
        instance_id: &str,
        sequence_index: u32,
        result: &ActivityResult,
    ) -> Result<(), CoreError>;

    /// Move the instance to `status`, validating the transition.
    ///
    /// `output` is stored only for Completed and `error` only for Failed,
    /// where it is required and must be non-empty.
    async fn set_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), CoreError>;

    /// List instances, oldest first, optionally filtered by status.
    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<bool, CoreError>;
}

pub(crate) fn check_transition(
    instance_id: &str,
    current: InstanceStatus,
    next: InstanceStatus,
    error: Option<&str>,
) -> Result<(), CoreError> {
    if !current.can_transition_to(next) {
        return Err(CoreError::InvalidInstanceState {
            instance_id: instance_id.to_string(),
            expected: expected_before(next).to_string(),
            actual: current.to_string(),
        });
    }
    if next == InstanceStatus::Failed && error.is_none_or(|e| e.trim().is_empty()) {
        return Err(CoreError::validation(
            "error",
            "failed instances require a non-empty error",
        ));
    }
    Ok(())
}

fn expected_before(next: InstanceStatus) -> &'static str {
    match next {
        InstanceStatus::Pending => "none",
        InstanceStatus::Running => "pending",
        InstanceStatus::Completed | InstanceStatus::Failed => "running",
    }
}

pub(crate) fn check_append(
    instance_id: &str,
    status: InstanceStatus,
    history_len: usize,
    event: &HistoryEvent,
) -> Result<(), CoreError> {
    if status.is_terminal() {
        return Err(CoreError::InvalidInstanceState {
            instance_id: instance_id.to_string(),
            expected: "running".to_string(),
            actual: status.to_string(),
        });
    }
    if event.result.is_some() {
        return Err(CoreError::validation(
            "result",
            "appended events must not carry a result",
        ));
    }
    let expected = history_len as u32;
    if event.sequence_index != expected {
        let reason = if event.sequence_index < expected {
            "index already recorded".to_string()
        } else {
            format!("expected index {expected}")
        };
        return Err(CoreError::HistoryConflict {
            instance_id: instance_id.to_string(),
            sequence_index: event.sequence_index,
            reason,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failed_requires_error() {
        let err = check_transition("i", InstanceStatus::Running, InstanceStatus::Failed, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = check_transition(
            "i",
            InstanceStatus::Running,
            InstanceStatus::Failed,
            Some(" "),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        check_transition(
            "i",
            InstanceStatus::Running,
            InstanceStatus::Failed,
            Some("boom"),
        )
        .unwrap();
    }

    #[test]
    fn test_terminal_cannot_reenter_running() {
        let err = check_transition(
            "i",
            InstanceStatus::Completed,
            InstanceStatus::Running,
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidInstanceState {
                instance_id: "i".to_string(),
                expected: "pending".to_string(),
                actual: "completed".to_string(),
            }
        );
    }

    #[test]
    fn test_append_rejects_gaps_and_duplicates() {
        let gap = HistoryEvent::scheduled(2, "A", json!(null));
        let err = check_append("i", InstanceStatus::Running, 1, &gap).unwrap_err();
        assert_eq!(err.error_code(), "HISTORY_CONFLICT");

        let duplicate = HistoryEvent::scheduled(0, "A", json!(null));
        let err = check_append("i", InstanceStatus::Running, 1, &duplicate).unwrap_err();
        assert!(err.to_string().contains("already recorded"));

        let next = HistoryEvent::scheduled(1, "A", json!(null));
        check_append("i", InstanceStatus::Running, 1, &next).unwrap();
    }

    #[test]
    fn test_append_rejected_after_terminal() {
        let event = HistoryEvent::scheduled(0, "A", json!(null));
        let err = check_append("i", InstanceStatus::Failed, 0, &event).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INSTANCE_STATE");
    }
}
