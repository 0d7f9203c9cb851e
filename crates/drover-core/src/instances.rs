// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance manager: creation, status queries and crash recovery.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::OrchestrationEngine;
use crate::error::{CoreError, Result};
use crate::model::{HistoryEvent, InstanceRecord, InstanceStatus};
use crate::persistence::DurableStore;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const RECOVERY_PAGE_SIZE: i64 = 100;

/// Read-only view of an instance's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceState {
    /// Instance ID.
    pub instance_id: String,
    /// Orchestration the instance runs.
    pub orchestrator_name: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Output when Completed.
    pub output: Option<Value>,
    /// Failure detail when Failed.
    pub error: Option<String>,
}

impl InstanceState {
    /// Whether the instance has finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<InstanceRecord> for InstanceState {
    fn from(record: InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id,
            orchestrator_name: record.orchestrator_name,
            status: record.status,
            output: record.output,
            error: record.error,
        }
    }
}

/// Creates instances and answers questions about them.
#[derive(Clone)]
pub struct InstanceManager {
    store: Arc<dyn DurableStore>,
    engine: Arc<OrchestrationEngine>,
}

impl InstanceManager {
    /// Create a manager on top of an engine and its store.
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            engine,
        }
    }

    /// Start a new instance with a generated ID.
    pub async fn start_new<I: Serialize>(&self, orchestrator_name: &str, input: I) -> Result<String> {
        let instance_id = Uuid::new_v4().to_string();
        self.start_new_with_id(&instance_id, orchestrator_name, input)
            .await
    }

    /// Start a new instance under a caller-chosen ID.
    ///
    /// The instance is persisted as Pending, moved to Running and given its
    /// first pass. A failed first pass is logged, not returned: the instance
    /// exists and resumes on recovery. If the move to Running fails the
    /// error is returned and the Pending instance is picked up by
    /// [`InstanceManager::ensure_started`] or [`InstanceManager::resume_running`].
    #[instrument(skip(self, input), fields(instance_id = %instance_id))]
    pub async fn start_new_with_id<I: Serialize>(
        &self,
        instance_id: &str,
        orchestrator_name: &str,
        input: I,
    ) -> Result<String> {
        if instance_id.trim().is_empty() {
            return Err(CoreError::validation("instance_id", "must not be empty"));
        }
        if !self.engine.is_registered(orchestrator_name) {
            return Err(CoreError::UnknownOrchestration {
                name: orchestrator_name.to_string(),
            });
        }
        let input = serde_json::to_value(input)?;

        self.store
            .create_instance(instance_id, orchestrator_name, &input)
            .await?;
        self.promote(instance_id).await?;
        info!(orchestrator = %orchestrator_name, "Instance started");

        match self.engine.run(instance_id).await {
            Ok(outcome) => debug!(?outcome, "First pass finished"),
            Err(e) => warn!(
                error = %e,
                code = e.error_code(),
                "First pass failed; instance resumes on recovery"
            ),
        }

        Ok(instance_id.to_string())
    }

    /// Drive an existing instance forward, whatever point it stopped at.
    ///
    /// Pending instances are moved to Running and replayed, Running ones have
    /// their outstanding calls re-dispatched and are replayed. Terminal
    /// instances are left alone.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn ensure_started(&self, instance_id: &str) -> Result<InstanceState> {
        let record = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found(instance_id))?;

        match record.status {
            InstanceStatus::Completed | InstanceStatus::Failed => {
                return Ok(InstanceState::from(record));
            }
            InstanceStatus::Pending => {
                self.promote(instance_id).await?;
                info!("Pending instance moved to Running");
            }
            InstanceStatus::Running => {}
        }

        let outcome = self.engine.resume(instance_id).await?;
        debug!(?outcome, "Instance driven forward");
        self.get_status(instance_id).await
    }

    /// Move a Pending instance to Running. Losing the race to another
    /// writer that already moved it is not an error.
    async fn promote(&self, instance_id: &str) -> Result<()> {
        match self
            .store
            .set_status(instance_id, InstanceStatus::Running, None, None)
            .await
        {
            Err(CoreError::InvalidInstanceState { actual, .. }) => {
                debug!(status = %actual, "Instance already left Pending");
                Ok(())
            }
            other => other,
        }
    }

    /// Current status, output and error of an instance.
    pub async fn get_status(&self, instance_id: &str) -> Result<InstanceState> {
        self.store
            .get_instance(instance_id)
            .await?
            .map(InstanceState::from)
            .ok_or_else(|| CoreError::not_found(instance_id))
    }

    /// Full activity history of an instance.
    pub async fn get_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        self.store.load_history(instance_id).await
    }

    /// List instances, oldest first.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceState>> {
        Ok(self
            .store
            .list_instances(status, limit, offset)
            .await?
            .into_iter()
            .map(InstanceState::from)
            .collect())
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceState> {
        let started = Instant::now();
        loop {
            let state = self.get_status(instance_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            if started.elapsed() >= timeout {
                return Err(CoreError::Timeout {
                    instance_id: instance_id.to_string(),
                    waited_ms: saturating_millis(timeout),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Resume every unfinished instance after a restart.
    ///
    /// Covers Running instances and Pending ones whose start was interrupted.
    /// Returns how many instances were resumed. Per-instance failures are
    /// logged and skipped.
    #[instrument(skip(self))]
    pub async fn resume_running(&self) -> Result<usize> {
        let mut unfinished = Vec::new();
        for status in [InstanceStatus::Pending, InstanceStatus::Running] {
            unfinished.extend(self.instance_ids_with(status).await?);
        }

        let mut resumed = 0;
        for instance_id in &unfinished {
            match self.ensure_started(instance_id).await {
                Ok(state) => {
                    debug!(instance_id = %instance_id, status = %state.status, "Instance resumed");
                    resumed += 1;
                }
                Err(e) => warn!(
                    instance_id = %instance_id,
                    error = %e,
                    code = e.error_code(),
                    "Failed to resume instance"
                ),
            }
        }

        info!(resumed, found = unfinished.len(), "Recovery finished");
        Ok(resumed)
    }

    async fn instance_ids_with(&self, status: InstanceStatus) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .list_instances(Some(status), RECOVERY_PAGE_SIZE, offset)
                .await?;
            let fetched = page.len() as i64;
            ids.extend(page.into_iter().map(|record| record.instance_id));
            if fetched < RECOVERY_PAGE_SIZE {
                return Ok(ids);
            }
            offset += fetched;
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
