// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for drover-core.
//!
//! [`Runtime`] wires a store, the orchestration and activity registries and
//! the dispatcher limit into an engine plus instance manager.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use drover_core::{ActivityRegistry, OrchestrationRegistry, Runtime, SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/drover.db").await?);
//!
//!     let runtime = Runtime::builder()
//!         .store(store)
//!         .orchestrations(orchestrations)
//!         .activities(activities)
//!         .build()?;
//!
//!     runtime.recover().await?;
//!     let id = runtime.instances().start_new("Orchestrator", "hello").await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::dispatcher::ActivityDispatcher;
use crate::engine::OrchestrationEngine;
use crate::instances::InstanceManager;
use crate::persistence::DurableStore;
use crate::registry::{ActivityRegistry, OrchestrationRegistry};
use crate::trigger::TriggerAdapter;

/// Default bound on concurrently executing activities.
pub const DEFAULT_MAX_CONCURRENT_ACTIVITIES: usize = 32;

/// Builder for creating a [`Runtime`].
pub struct RuntimeBuilder {
    store: Option<Arc<dyn DurableStore>>,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    max_concurrent_activities: usize,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("orchestrations", &self.orchestrations.names())
            .field("activities", &self.activities.names())
            .field("max_concurrent_activities", &self.max_concurrent_activities)
            .finish()
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            orchestrations: OrchestrationRegistry::default(),
            activities: ActivityRegistry::default(),
            max_concurrent_activities: DEFAULT_MAX_CONCURRENT_ACTIVITIES,
        }
    }
}

impl RuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the durable store (required).
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the orchestration registry.
    pub fn orchestrations(mut self, orchestrations: OrchestrationRegistry) -> Self {
        self.orchestrations = orchestrations;
        self
    }

    /// Set the activity registry.
    pub fn activities(mut self, activities: ActivityRegistry) -> Self {
        self.activities = activities;
        self
    }

    /// Bound the number of concurrently executing activities.
    ///
    /// Default: 32
    pub fn max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max;
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if the store is missing or the concurrency bound is zero.
    pub fn build(self) -> Result<Runtime> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        if self.max_concurrent_activities == 0 {
            anyhow::bail!("max_concurrent_activities must be greater than zero");
        }

        info!(
            orchestrations = ?self.orchestrations.names(),
            activities = ?self.activities.names(),
            max_concurrent_activities = self.max_concurrent_activities,
            "Building drover runtime"
        );

        let dispatcher = Arc::new(ActivityDispatcher::new(
            self.activities,
            self.max_concurrent_activities,
        ));
        let engine = OrchestrationEngine::new(store, self.orchestrations, dispatcher);
        let instances = InstanceManager::new(Arc::clone(&engine));

        Ok(Runtime { engine, instances })
    }
}

/// An assembled engine and instance manager sharing one store.
#[derive(Clone)]
pub struct Runtime {
    engine: Arc<OrchestrationEngine>,
    instances: InstanceManager,
}

impl Runtime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The orchestration engine.
    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    /// The instance manager.
    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    /// The durable store.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        self.engine.store()
    }

    /// A trigger adapter starting `orchestrator_name` for each message.
    pub fn trigger(&self, orchestrator_name: impl Into<String>) -> TriggerAdapter {
        TriggerAdapter::new(self.instances.clone(), orchestrator_name)
    }

    /// Resume every unfinished instance. Safe to call again while instances run.
    pub async fn recover(&self) -> Result<usize> {
        Ok(self.instances.resume_running().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    #[test]
    fn test_builder_requires_store() {
        let result = Runtime::builder().build();
        assert!(result.is_err());
        assert!(
            result
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default()
                .contains("store is required")
        );
    }

    #[test]
    fn test_builder_rejects_zero_concurrency() {
        let result = Runtime::builder()
            .store(Arc::new(InMemoryStore::new()))
            .max_concurrent_activities(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_debug() {
        let builder = Runtime::builder().store(Arc::new(InMemoryStore::new()));
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("RuntimeBuilder"));
        assert!(debug_str.contains("max_concurrent_activities: 32"));
    }

    #[tokio::test]
    async fn test_recover_with_empty_store() {
        let runtime = Runtime::builder()
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();
        assert_eq!(runtime.recover().await.unwrap(), 0);
        assert!(runtime.store().health_check().await.unwrap());
    }
}
