// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity dispatcher.
//!
//! Resolves activities by name and runs them on tokio tasks. The dispatcher
//! knows nothing about orchestrations: it turns one `(name, input)` pair into
//! one [`ActivityResult`], capturing errors and panics as failures.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::model::ActivityResult;
use crate::registry::ActivityRegistry;

/// A named unit of work invoked with a JSON input.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    /// Run the activity.
    async fn invoke(&self, input: Value) -> anyhow::Result<Value>;
}

/// Adapter turning an async function into an [`ActivityHandler`].
pub struct FnActivity<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnActivity<F, Fut> {
    /// Wrap an async function.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, input: Value) -> anyhow::Result<Value> {
        (self.f)(input).await
    }
}

/// Executes registered activities with bounded concurrency.
pub struct ActivityDispatcher {
    registry: ActivityRegistry,
    permits: Arc<Semaphore>,
}

impl ActivityDispatcher {
    /// Create a dispatcher allowing at most `max_concurrent` running activities.
    pub fn new(registry: ActivityRegistry, max_concurrent: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// The registry activities are resolved from.
    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Invoke `name` with `input` and wait for the outcome.
    ///
    /// Never returns an error: unknown names, handler errors and panics all
    /// become [`ActivityResult::Failed`] with a non-empty detail.
    #[instrument(skip(self, input), fields(activity = %name))]
    pub async fn invoke(&self, name: &str, input: Value) -> ActivityResult {
        let Some(handler) = self.registry.get(name) else {
            warn!("Activity is not registered");
            return ActivityResult::Failed(format!("activity '{name}' is not registered"));
        };

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ActivityResult::Failed(format!(
                    "activity '{name}' could not start: dispatcher is closed"
                ));
            }
        };

        debug!("Activity started");
        let task = tokio::spawn(async move { handler.invoke(input).await });

        match task.await {
            Ok(Ok(value)) => {
                debug!("Activity completed");
                ActivityResult::Completed(value)
            }
            Ok(Err(e)) => {
                let detail = format!("{e:#}");
                warn!(error = %detail, "Activity failed");
                ActivityResult::Failed(non_empty(detail, name))
            }
            Err(join_err) if join_err.is_panic() => {
                let detail = format!(
                    "activity '{name}' panicked: {}",
                    panic_message(join_err.into_panic())
                );
                warn!(error = %detail, "Activity panicked");
                ActivityResult::Failed(detail)
            }
            Err(_) => ActivityResult::Failed(format!("activity '{name}' was cancelled")),
        }
    }
}

fn non_empty(detail: String, name: &str) -> String {
    if detail.trim().is_empty() {
        format!("activity '{name}' failed")
    } else {
        detail
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry() -> ActivityRegistry {
        ActivityRegistry::builder()
            .register("Echo", |input: Value| async move { anyhow::Ok(input) })
            .register("Fail", |_input: Value| async move {
                Err::<Value, _>(anyhow::anyhow!("upstream rejected").context("calling billing"))
            })
            .register("Blank", |_input: Value| async move {
                Err::<Value, _>(anyhow::anyhow!(""))
            })
            .register("Panic", |_input: Value| async move {
                if true {
                    panic!("handler exploded");
                }
                anyhow::Ok(Value::Null)
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let dispatcher = ActivityDispatcher::new(registry(), 4);
        let result = dispatcher.invoke("Echo", json!({"a": 1})).await;
        assert_eq!(result, ActivityResult::Completed(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_invoke_error_keeps_context_chain() {
        let dispatcher = ActivityDispatcher::new(registry(), 4);
        let result = dispatcher.invoke("Fail", json!(null)).await;
        assert_eq!(
            result,
            ActivityResult::Failed("calling billing: upstream rejected".to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_error_gets_detail() {
        let dispatcher = ActivityDispatcher::new(registry(), 4);
        let result = dispatcher.invoke("Blank", json!(null)).await;
        assert_eq!(
            result,
            ActivityResult::Failed("activity 'Blank' failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let dispatcher = ActivityDispatcher::new(registry(), 4);
        match dispatcher.invoke("Panic", json!(null)).await {
            ActivityResult::Failed(detail) => assert!(detail.contains("handler exploded")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_activity() {
        let dispatcher = ActivityDispatcher::new(registry(), 4);
        let result = dispatcher.invoke("Nope", json!(null)).await;
        assert_eq!(
            result,
            ActivityResult::Failed("activity 'Nope' is not registered".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        let registry = ActivityRegistry::builder()
            .register("Slow", move |input: Value| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    anyhow::Ok(input)
                }
            })
            .build()
            .unwrap();
        let dispatcher = Arc::new(ActivityDispatcher::new(registry, 2));

        let calls = (0..6).map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.invoke("Slow", json!(i)).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| !r.is_failure()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
