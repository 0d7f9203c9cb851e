// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Name-keyed registries for orchestrations and activities.
//!
//! Both registries are built once at process start and are immutable
//! afterwards; cloning a registry is cheap.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::dispatcher::{ActivityHandler, FnActivity};
use crate::error::CoreError;
use crate::orchestration::{OrchestrationContext, OrchestrationError, Orchestrator};

/// Immutable map from name to handler.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

/// Builder collecting registrations; duplicate names are reported by `build`.
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

/// Registry of orchestration functions.
pub type OrchestrationRegistry = Registry<dyn Orchestrator>;
/// Registry of activity handlers.
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
/// Builder for [`OrchestrationRegistry`].
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn Orchestrator>;
/// Builder for [`ActivityRegistry`].
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    /// Start an empty builder.
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let handler = self.inner.get(name).cloned();
        if handler.is_none() {
            tracing::debug!(
                requested_name = %name,
                registered = ?self.names(),
                "Registry lookup missed"
            );
        }
        handler
    }

    /// Check if a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Register an already type-erased handler.
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<H>) -> Self {
        let name = name.into();
        if name.trim().is_empty() {
            self.errors.push("handler names must not be empty".to_string());
        } else if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate registration for '{name}'"));
        } else {
            self.map.insert(name, handler);
        }
        self
    }

    /// Finish the registry, failing on any invalid registration.
    pub fn build(self) -> Result<Registry<H>, CoreError> {
        if !self.errors.is_empty() {
            return Err(CoreError::validation("registry", self.errors.join("; ")));
        }
        Ok(Registry {
            inner: Arc::new(self.map),
        })
    }
}

impl RegistryBuilder<dyn Orchestrator> {
    /// Register an orchestration function under `name`.
    pub fn register<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut OrchestrationContext) -> Result<Value, OrchestrationError>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(name, Arc::new(f))
    }
}

impl RegistryBuilder<dyn ActivityHandler> {
    /// Register an async activity function under `name`.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnActivity::new(f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_names_rejected() {
        let err = ActivityRegistry::builder()
            .register("Echo", |v: Value| async move { anyhow::Ok(v) })
            .register("Echo", |v: Value| async move { anyhow::Ok(v) })
            .build()
            .err()
            .expect("duplicate should fail");
        assert!(err.to_string().contains("duplicate registration for 'Echo'"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = OrchestrationRegistry::builder()
            .register(" ", |_ctx: &mut OrchestrationContext| Ok(json!(null)))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup() {
        let registry = OrchestrationRegistry::builder()
            .register("B", |_ctx: &mut OrchestrationContext| Ok(json!(2)))
            .register("A", |_ctx: &mut OrchestrationContext| Ok(json!(1)))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("A"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["A".to_string(), "B".to_string()]);

        let clone = registry.clone();
        assert!(clone.get("B").is_some());
    }
}
