// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for drover-core integration tests.
//!
//! Provides sample registries, an invocation counter, a gate for holding
//! activities in flight, and a store wrapper that injects write failures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use drover_core::{
    ActivityRegistry, ActivityResult, CoreError, DurableStore, HistoryEvent, InstanceRecord,
    InstanceState, InstanceStatus, OrchestrationContext, OrchestrationError,
    OrchestrationRegistry, RetryPolicy, Runtime,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Counts activity invocations by name.
#[derive(Clone, Default)]
pub struct Invocations {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl Invocations {
    pub fn record(&self, name: &str) {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
    }

    pub fn get(&self, name: &str) -> usize {
        self.counts.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

/// Holds `Gated` activities until permits are released.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

/// Activities used across the integration tests.
///
/// - `ProcessMessage`: `"Processed message: <input>"`, fails for `"bad"`
/// - `Double`: doubles a number
/// - `Refund`: compensation step, returns `"refunded <input>"`
/// - `Flaky`: fails on its first two invocations
/// - `Gated`: echoes its input once the gate lets it through
pub fn activities(invocations: &Invocations, gate: &Gate) -> ActivityRegistry {
    let flaky_calls = Arc::new(AtomicU32::new(0));

    ActivityRegistry::builder()
        .register("ProcessMessage", {
            let invocations = invocations.clone();
            move |input: Value| {
                let invocations = invocations.clone();
                async move {
                    invocations.record("ProcessMessage");
                    let message = input.as_str().unwrap_or_default().to_string();
                    if message == "bad" {
                        anyhow::bail!("cannot process message 'bad'");
                    }
                    anyhow::Ok(json!(format!("Processed message: {message}")))
                }
            }
        })
        .register("Double", {
            let invocations = invocations.clone();
            move |input: Value| {
                let invocations = invocations.clone();
                async move {
                    invocations.record("Double");
                    let n = input
                        .as_i64()
                        .ok_or_else(|| anyhow::anyhow!("Double expects a number"))?;
                    anyhow::Ok(json!(n * 2))
                }
            }
        })
        .register("Refund", {
            let invocations = invocations.clone();
            move |input: Value| {
                let invocations = invocations.clone();
                async move {
                    invocations.record("Refund");
                    anyhow::Ok(json!(format!("refunded {}", input)))
                }
            }
        })
        .register("Flaky", {
            let invocations = invocations.clone();
            move |input: Value| {
                let invocations = invocations.clone();
                let flaky_calls = Arc::clone(&flaky_calls);
                async move {
                    invocations.record("Flaky");
                    if flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient outage");
                    }
                    anyhow::Ok(input)
                }
            }
        })
        .register("Gated", {
            let invocations = invocations.clone();
            let gate = gate.clone();
            move |input: Value| {
                let invocations = invocations.clone();
                let gate = gate.clone();
                async move {
                    invocations.record("Gated");
                    gate.pass().await;
                    anyhow::Ok(input)
                }
            }
        })
        .build()
        .expect("activity registry")
}

/// Orchestrations used across the integration tests.
///
/// - `Orchestrator`: one `ProcessMessage` call with the instance input
/// - `Pipeline`: `Double` three times
/// - `Compensating`: `ProcessMessage`, on failure `Refund` and complete
/// - `Retrying`: `Flaky` with three attempts
/// - `GatedPair`: `Gated` then `Double`
pub fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Orchestrator", |ctx: &mut OrchestrationContext| {
            let input = ctx.input().clone();
            ctx.call_activity("ProcessMessage", input)
        })
        .register("Pipeline", |ctx: &mut OrchestrationContext| {
            let mut value = ctx.input().clone();
            for _ in 0..3 {
                value = ctx.call_activity("Double", value)?;
            }
            Ok(value)
        })
        .register("Compensating", |ctx: &mut OrchestrationContext| {
            let input = ctx.input().clone();
            match ctx.call_activity("ProcessMessage", &input) {
                Ok(value) => Ok(value),
                Err(OrchestrationError::ActivityFailed { .. }) => {
                    ctx.call_activity("Refund", &input)
                }
                Err(e) => Err(e),
            }
        })
        .register("Retrying", |ctx: &mut OrchestrationContext| {
            let input = ctx.input().clone();
            ctx.call_activity_with_retry("Flaky", input, RetryPolicy::attempts(3))
        })
        .register("GatedPair", |ctx: &mut OrchestrationContext| {
            let input = ctx.input().clone();
            let first = ctx.call_activity("Gated", input)?;
            ctx.call_activity("Double", first)
        })
        .build()
        .expect("orchestration registry")
}

pub fn runtime(store: Arc<dyn DurableStore>, invocations: &Invocations, gate: &Gate) -> Runtime {
    Runtime::builder()
        .store(store)
        .orchestrations(orchestrations())
        .activities(activities(invocations, gate))
        .max_concurrent_activities(8)
        .build()
        .expect("runtime")
}

pub async fn wait_terminal(runtime: &Runtime, instance_id: &str) -> InstanceState {
    runtime
        .instances()
        .wait_for_completion(instance_id, WAIT)
        .await
        .expect("instance should reach a terminal status")
}

/// Poll until the instance history has `len` events.
pub async fn wait_history_len(store: &dyn DurableStore, instance_id: &str, len: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let history = store.load_history(instance_id).await.expect("history");
        if history.len() >= len {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history of {instance_id} never reached {len} events"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A store wrapper that fails selected writes.
///
/// Each `fail_*` counter makes that many upcoming calls return a transient
/// database error without touching the inner store.
pub struct FlakyStore {
    inner: Arc<dyn DurableStore>,
    pub fail_appends: AtomicU32,
    pub fail_completions: AtomicU32,
    pub fail_status_updates: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn DurableStore>) -> Self {
        Self {
            inner,
            fail_appends: AtomicU32::new(0),
            fail_completions: AtomicU32::new(0),
            fail_status_updates: AtomicU32::new(0),
        }
    }

    fn take_fault(counter: &AtomicU32, operation: &str) -> Result<(), CoreError> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoreError::DatabaseError {
                operation: operation.to_string(),
                details: "injected fault".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn create_instance(
        &self,
        instance_id: &str,
        orchestrator_name: &str,
        input: &Value,
    ) -> Result<(), CoreError> {
        self.inner
            .create_instance(instance_id, orchestrator_name, input)
            .await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        self.inner.get_instance(instance_id).await
    }

    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, CoreError> {
        self.inner.load_history(instance_id).await
    }

    async fn append_event(&self, instance_id: &str, event: &HistoryEvent) -> Result<(), CoreError> {
        Self::take_fault(&self.fail_appends, "append_event")?;
        self.inner.append_event(instance_id, event).await
    }

    async fn complete_event(
        &self,
        instance_id: &str,
        sequence_index: u32,
        result: &ActivityResult,
    ) -> Result<(), CoreError> {
        Self::take_fault(&self.fail_completions, "complete_event")?;
        self.inner
            .complete_event(instance_id, sequence_index, result)
            .await
    }

    async fn set_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        Self::take_fault(&self.fail_status_updates, "set_status")?;
        self.inner
            .set_status(instance_id, status, output, error)
            .await
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        self.inner.list_instances(status, limit, offset).await
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        self.inner.health_check().await
    }
}
