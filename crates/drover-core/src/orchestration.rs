// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration functions and the replay context they run against.
//!
//! An orchestration is a plain synchronous function. Every pass starts from
//! the beginning with a fresh [`OrchestrationContext`] built from the stored
//! history. Calls that already have a result return it immediately; the first
//! call without one makes the function return early with
//! [`OrchestrationError::Suspended`], which callers propagate with `?`.
//!
//! ```ignore
//! fn greet(ctx: &mut OrchestrationContext) -> Result<Value, OrchestrationError> {
//!     let name: String = ctx.input_as()?;
//!     let greeting = ctx.call_activity("Greet", &name)?;
//!     ctx.call_activity("Deliver", greeting)
//! }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::model::{ActivityResult, HistoryEvent};

/// A registered orchestration function.
///
/// Implementations must be deterministic: given the same input and the same
/// history they must request the same sequence of activity calls.
pub trait Orchestrator: Send + Sync {
    /// Run one replay pass.
    fn run(&self, ctx: &mut OrchestrationContext) -> Result<Value, OrchestrationError>;
}

impl<F> Orchestrator for F
where
    F: Fn(&mut OrchestrationContext) -> Result<Value, OrchestrationError> + Send + Sync,
{
    fn run(&self, ctx: &mut OrchestrationContext) -> Result<Value, OrchestrationError> {
        self(ctx)
    }
}

/// Ways an orchestration pass can end without a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrationError {
    /// The call at `sequence_index` has no result yet.
    #[error("orchestration suspended awaiting activity at index {sequence_index}")]
    Suspended {
        /// Index the orchestration is blocked on.
        sequence_index: u32,
    },

    /// An activity call recorded a failure.
    #[error("activity '{activity_name}' failed at index {sequence_index}: {detail}")]
    ActivityFailed {
        /// Failed activity.
        activity_name: String,
        /// Index of the failed call.
        sequence_index: u32,
        /// Failure detail recorded in history.
        detail: String,
    },

    /// The orchestration requested a different call than history recorded.
    #[error(
        "nondeterministic orchestration at index {sequence_index}: history recorded {recorded}, orchestration requested {requested}"
    )]
    Nondeterministic {
        /// Index where replay diverged.
        sequence_index: u32,
        /// The recorded call.
        recorded: String,
        /// The call requested on this pass.
        requested: String,
    },

    /// The orchestration failed on its own terms.
    #[error("{0}")]
    Failed(String),
}

impl OrchestrationError {
    /// Fail the orchestration with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether this is a suspension rather than a failure.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("payload serialization failed: {err}"))
    }
}

/// How many times [`OrchestrationContext::call_activity_with_retry`] issues a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Retry up to `max_attempts` calls in total.
    pub fn attempts(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Replay state for a single orchestration pass.
pub struct OrchestrationContext {
    instance_id: String,
    input: Value,
    history: Vec<HistoryEvent>,
    cursor: usize,
    suspended_at: Option<u32>,
    scheduled: Option<HistoryEvent>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: &str, input: Value, history: Vec<HistoryEvent>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            input,
            history,
            cursor: 0,
            suspended_at: None,
            scheduled: None,
        }
    }

    /// ID of the instance being replayed.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Raw instance input.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Instance input deserialized into `T`.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, OrchestrationError> {
        Ok(serde_json::from_value(self.input.clone())?)
    }

    /// True while the next call will be answered from history.
    ///
    /// Use it to keep logging inside an orchestration from repeating on
    /// every pass.
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.history.len()
    }

    /// Call an activity and return its value.
    ///
    /// Returns [`OrchestrationError::Suspended`] when the result is not yet
    /// known and [`OrchestrationError::ActivityFailed`] when the activity
    /// recorded a failure.
    pub fn call_activity<I: Serialize>(
        &mut self,
        activity_name: &str,
        input: I,
    ) -> Result<Value, OrchestrationError> {
        if let Some(sequence_index) = self.suspended_at {
            return Err(OrchestrationError::Suspended { sequence_index });
        }

        let input = serde_json::to_value(input)?;
        let sequence_index = self.cursor as u32;

        let Some(event) = self.history.get(self.cursor) else {
            self.scheduled = Some(HistoryEvent::scheduled(
                sequence_index,
                activity_name,
                input,
            ));
            return Err(self.suspend(sequence_index));
        };

        if event.activity_name != activity_name || event.input_snapshot != input {
            return Err(OrchestrationError::Nondeterministic {
                sequence_index,
                recorded: format!("{}({})", event.activity_name, event.input_snapshot),
                requested: format!("{}({})", activity_name, input),
            });
        }

        match &event.result {
            Some(ActivityResult::Completed(value)) => {
                let value = value.clone();
                self.cursor += 1;
                Ok(value)
            }
            Some(ActivityResult::Failed(detail)) => {
                let detail = detail.clone();
                self.cursor += 1;
                Err(OrchestrationError::ActivityFailed {
                    activity_name: activity_name.to_string(),
                    sequence_index,
                    detail,
                })
            }
            None => Err(self.suspend(sequence_index)),
        }
    }

    /// Call an activity, issuing a fresh call after each recorded failure.
    ///
    /// Each attempt occupies its own history index.
    pub fn call_activity_with_retry<I: Serialize>(
        &mut self,
        activity_name: &str,
        input: I,
        policy: RetryPolicy,
    ) -> Result<Value, OrchestrationError> {
        let input = serde_json::to_value(input)?;
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.call_activity(activity_name, &input) {
                Err(OrchestrationError::ActivityFailed { .. }) if attempt < attempts => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn suspend(&mut self, sequence_index: u32) -> OrchestrationError {
        self.suspended_at = Some(sequence_index);
        OrchestrationError::Suspended { sequence_index }
    }

    /// Index this pass suspended on, if any.
    pub(crate) fn suspended_at(&self) -> Option<u32> {
        self.suspended_at
    }

    /// The new call requested on this pass, if any.
    pub(crate) fn take_scheduled(&mut self) -> Option<HistoryEvent> {
        self.scheduled.take()
    }

    /// Number of history entries consumed so far.
    pub(crate) fn consumed(&self) -> usize {
        self.cursor
    }
}
