// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration engine.
//!
//! [`OrchestrationEngine::run`] replays an instance's orchestration from the
//! start against its stored history:
//!
//! ```text
//!   run(id) ──► load record + history ──► orchestrator(ctx)
//!                                            │
//!          ┌─────────────────────────────────┼──────────────────────┐
//!          ▼                                 ▼                      ▼
//!   new call requested              blocked on outstanding     returned
//!   append event, spawn activity    call: nothing to do        set Completed/Failed
//!          │
//!          ▼
//!   activity task: dispatch ──► complete_event ──► run(id)
//! ```
//!
//! Passes for one instance are serialized by a per-instance async lock.
//! Different instances run in parallel. A call is executed by at most one
//! task per engine at a time; re-dispatching a call that is still in flight
//! is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::dispatcher::ActivityDispatcher;
use crate::error::{CoreError, Result};
use crate::model::{ActivityResult, HistoryEvent, InstanceStatus};
use crate::orchestration::OrchestrationContext;
use crate::persistence::DurableStore;
use crate::registry::OrchestrationRegistry;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Linear backoff for store retries, capped at [`MAX_RETRY_BACKOFF`].
fn retry_backoff(attempt: u32) -> Duration {
    (RETRY_BACKOFF * attempt).min(MAX_RETRY_BACKOFF)
}

/// What a single [`OrchestrationEngine::run`] pass ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The orchestration is waiting on the call at `sequence_index`.
    Suspended {
        /// Index the orchestration is blocked on.
        sequence_index: u32,
        /// Whether this pass appended and dispatched that call.
        scheduled: bool,
    },
    /// The instance is Completed with this output.
    Completed(Value),
    /// The instance is Failed with this detail.
    Failed(String),
}

impl RunOutcome {
    /// Whether the instance has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::Suspended { .. })
    }
}

/// Async locks keyed by instance ID.
///
/// Entries are dropped once no pass holds or waits on them.
#[derive(Default)]
struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    async fn acquire(&self, instance_id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.table()?;
            Arc::clone(locks.entry(instance_id.to_string()).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    fn release(&self, instance_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        if let Ok(mut locks) = self.locks.lock()
            && locks
                .get(instance_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(instance_id);
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>>> {
        self.locks.lock().map_err(|_| CoreError::DatabaseError {
            operation: "instance_lock".to_string(),
            details: "instance lock table poisoned".to_string(),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

type CallKey = (String, u32);

/// Calls currently executing in this process.
#[derive(Default)]
struct InFlightCalls {
    calls: Mutex<HashSet<CallKey>>,
}

impl InFlightCalls {
    /// Claim a call; `None` if another task already holds it.
    fn claim(self: &Arc<Self>, instance_id: &str, sequence_index: u32) -> Option<CallClaim> {
        let key = (instance_id.to_string(), sequence_index);
        let claimed = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        claimed.then(|| CallClaim {
            calls: Arc::clone(self),
            key,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases its call when dropped, including when the task is aborted.
struct CallClaim {
    calls: Arc<InFlightCalls>,
    key: CallKey,
}

impl Drop for CallClaim {
    fn drop(&mut self) {
        self.calls
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Replays orchestrations and drives their activity calls.
pub struct OrchestrationEngine {
    store: Arc<dyn DurableStore>,
    orchestrations: OrchestrationRegistry,
    dispatcher: Arc<ActivityDispatcher>,
    locks: InstanceLocks,
    in_flight: Arc<InFlightCalls>,
}

impl OrchestrationEngine {
    /// Assemble an engine. Most callers use [`crate::Runtime::builder`] instead.
    pub fn new(
        store: Arc<dyn DurableStore>,
        orchestrations: OrchestrationRegistry,
        dispatcher: Arc<ActivityDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            orchestrations,
            dispatcher,
            locks: InstanceLocks::default(),
            in_flight: Arc::default(),
        })
    }

    /// The store backing this engine.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Whether an orchestration is registered under `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.orchestrations.contains(name)
    }

    /// Replay the instance once.
    ///
    /// Idempotent: with unchanged history a second pass appends nothing and
    /// dispatches nothing. Terminal instances report their recorded outcome.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn run(self: &Arc<Self>, instance_id: &str) -> Result<RunOutcome> {
        let guard = self.locks.acquire(instance_id).await?;
        let outcome = self.run_locked(instance_id).await;
        self.locks.release(instance_id, guard);
        outcome
    }

    /// Re-dispatch every outstanding call of a Running instance, then replay it.
    ///
    /// Used after a restart: calls whose result never got recorded are
    /// executed again, so in-flight activities are at-least-once across a crash.
    /// Calls still executing in this process are left alone.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn resume(self: &Arc<Self>, instance_id: &str) -> Result<RunOutcome> {
        let guard = self.locks.acquire(instance_id).await?;
        let redispatched = self.redispatch_outstanding(instance_id).await;
        self.locks.release(instance_id, guard);

        let count = redispatched?;
        if count > 0 {
            info!(count, "Re-dispatched outstanding activities");
        }
        self.run(instance_id).await
    }

    async fn redispatch_outstanding(self: &Arc<Self>, instance_id: &str) -> Result<usize> {
        let record = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found(instance_id))?;
        if record.status != InstanceStatus::Running {
            return Ok(0);
        }

        let outstanding: Vec<HistoryEvent> = self
            .store
            .load_history(instance_id)
            .await?
            .into_iter()
            .filter(|event| !event.is_completed())
            .collect();
        let mut count = 0;
        for event in outstanding {
            if self.dispatch(instance_id, event) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn run_locked(self: &Arc<Self>, instance_id: &str) -> Result<RunOutcome> {
        let record = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found(instance_id))?;

        match record.status {
            InstanceStatus::Completed => {
                return Ok(RunOutcome::Completed(record.output.unwrap_or(Value::Null)));
            }
            InstanceStatus::Failed => {
                return Ok(RunOutcome::Failed(record.error.unwrap_or_default()));
            }
            InstanceStatus::Pending => {
                return Err(CoreError::InvalidInstanceState {
                    instance_id: instance_id.to_string(),
                    expected: InstanceStatus::Running.to_string(),
                    actual: record.status.to_string(),
                });
            }
            InstanceStatus::Running => {}
        }

        let Some(orchestrator) = self.orchestrations.get(&record.orchestrator_name) else {
            let detail = format!(
                "orchestration '{}' is not registered",
                record.orchestrator_name
            );
            return self.fail(instance_id, detail).await;
        };

        let history = self.store.load_history(instance_id).await?;
        let recorded = history.len();
        let mut ctx = OrchestrationContext::new(instance_id, record.input, history);
        let result = orchestrator.run(&mut ctx);

        if let Some(sequence_index) = ctx.suspended_at() {
            let Some(event) = ctx.take_scheduled() else {
                debug!(sequence_index, "Awaiting outstanding activity");
                return Ok(RunOutcome::Suspended {
                    sequence_index,
                    scheduled: false,
                });
            };

            // Persist before dispatching so a result never precedes its event.
            self.store.append_event(instance_id, &event).await?;
            info!(
                sequence_index,
                activity = %event.activity_name,
                "Activity scheduled"
            );
            self.dispatch(instance_id, event);
            return Ok(RunOutcome::Suspended {
                sequence_index,
                scheduled: true,
            });
        }

        if ctx.consumed() < recorded {
            warn!(
                consumed = ctx.consumed(),
                recorded, "Orchestration finished without replaying its full history"
            );
        }

        match result {
            Ok(output) => {
                self.store
                    .set_status(instance_id, InstanceStatus::Completed, Some(&output), None)
                    .await?;
                info!(status = %InstanceStatus::Completed, "Orchestration completed");
                Ok(RunOutcome::Completed(output))
            }
            Err(e) => self.fail(instance_id, e.to_string()).await,
        }
    }

    async fn fail(&self, instance_id: &str, detail: String) -> Result<RunOutcome> {
        let detail = if detail.trim().is_empty() {
            "orchestration failed".to_string()
        } else {
            detail
        };
        self.store
            .set_status(instance_id, InstanceStatus::Failed, None, Some(&detail))
            .await?;
        warn!(status = %InstanceStatus::Failed, error = %detail, "Orchestration failed");
        Ok(RunOutcome::Failed(detail))
    }

    /// Spawn the call unless it is already executing. Returns whether it was spawned.
    fn dispatch(self: &Arc<Self>, instance_id: &str, event: HistoryEvent) -> bool {
        let Some(claim) = self.in_flight.claim(instance_id, event.sequence_index) else {
            debug!(
                sequence_index = event.sequence_index,
                "Activity already in flight, not dispatching again"
            );
            return false;
        };

        let engine = Arc::clone(self);
        let span = info_span!(
            "activity",
            instance_id = %instance_id,
            sequence_index = event.sequence_index,
            activity = %event.activity_name,
        );
        let instance_id = instance_id.to_string();
        tokio::spawn(
            async move { engine.complete_activity(instance_id, event, claim).await }
                .instrument(span),
        );
        true
    }

    async fn complete_activity(
        self: Arc<Self>,
        instance_id: String,
        event: HistoryEvent,
        claim: CallClaim,
    ) {
        let result = self
            .dispatcher
            .invoke(&event.activity_name, event.input_snapshot)
            .await;

        let recorded = self
            .record_result(&instance_id, event.sequence_index, &result)
            .await;
        drop(claim);
        if let Err(e) = recorded {
            error!(error = %e, code = e.error_code(), "Failed to record activity result");
            return;
        }

        self.replay_after_completion(&instance_id).await;
    }

    /// Write the result, retrying transient store errors until it sticks.
    async fn record_result(
        &self,
        instance_id: &str,
        sequence_index: u32,
        result: &ActivityResult,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .complete_event(instance_id, sequence_index, result)
                .await
            {
                Ok(()) => return Ok(()),
                Err(CoreError::ResultAlreadyRecorded { .. }) => {
                    debug!("Result already recorded; keeping the first one");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempt, "Recording activity result failed, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replay once the result is durable. Nothing else would drive the
    /// instance forward, so transient failures are retried here.
    async fn replay_after_completion(self: &Arc<Self>, instance_id: &str) {
        let mut attempt = 1;
        loop {
            match self.run(instance_id).await {
                Ok(_) => return,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempt, "Replay after activity completion failed, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = %e, code = e.error_code(), "Replay after activity completion failed");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    #[cfg(test)]
    fn in_flight_calls(&self) -> usize {
        self.in_flight.len()
    }
}
