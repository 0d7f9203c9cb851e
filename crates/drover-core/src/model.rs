// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance and history records shared by the store, engine and manager.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Lifecycle status of an orchestration instance.
///
/// Transitions only move forward: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet started.
    Pending,
    /// Replaying or waiting on an activity.
    Running,
    /// Orchestrator returned a value.
    Completed,
    /// Orchestrator returned an error.
    Failed,
}

impl InstanceStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Completed and Failed never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }

    /// Lowercase name as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(CoreError::validation(
                "status",
                format!("unknown instance status '{other}'"),
            )),
        }
    }
}

/// Outcome of one activity call as recorded in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActivityResult {
    /// The activity returned a value.
    Completed(Value),
    /// The activity returned an error or panicked.
    Failed(String),
}

impl ActivityResult {
    /// Whether this result is a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, ActivityResult::Failed(_))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ActivityResult::Completed(_) => "completed",
            ActivityResult::Failed(_) => "failed",
        }
    }
}

/// A persisted orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique identifier, immutable once created.
    pub instance_id: String,
    /// Registered orchestration this instance runs.
    pub orchestrator_name: String,
    /// Input supplied at creation.
    pub input: Value,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Orchestrator return value, set only when Completed.
    pub output: Option<Value>,
    /// Failure detail, set only when Failed.
    pub error: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// A fresh Pending record.
    pub fn pending(instance_id: &str, orchestrator_name: &str, input: Value) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            orchestrator_name: orchestrator_name.to_string(),
            input,
            status: InstanceStatus::Pending,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// One activity call in an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Zero-based position in call order.
    pub sequence_index: u32,
    /// Activity invoked at this position.
    pub activity_name: String,
    /// Input sent to the activity.
    pub input_snapshot: Value,
    /// Recorded outcome, `None` while the call is outstanding.
    pub result: Option<ActivityResult>,
    /// When the call was appended.
    pub scheduled_at: DateTime<Utc>,
    /// When the result was recorded.
    pub completed_at: Option<DateTime<Utc>>,
}

impl HistoryEvent {
    /// A newly scheduled call without a result.
    pub fn scheduled(sequence_index: u32, activity_name: &str, input_snapshot: Value) -> Self {
        Self {
            sequence_index,
            activity_name: activity_name.to_string(),
            input_snapshot,
            result: None,
            scheduled_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether a result has been recorded.
    pub fn is_completed(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use InstanceStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }

        let err = "suspended".parse::<InstanceStatus>().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_activity_result_serialization() {
        let completed = ActivityResult::Completed(json!("done"));
        assert_eq!(
            serde_json::to_value(&completed).unwrap(),
            json!({"kind": "completed", "value": "done"})
        );
        assert!(!completed.is_failure());

        let failed = ActivityResult::Failed("boom".to_string());
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"kind": "failed", "value": "boom"})
        );
        assert!(failed.is_failure());
    }

    #[test]
    fn test_scheduled_event_has_no_result() {
        let event = HistoryEvent::scheduled(2, "ProcessMessage", json!("hello"));
        assert_eq!(event.sequence_index, 2);
        assert!(!event.is_completed());
        assert!(event.completed_at.is_none());
    }
}
