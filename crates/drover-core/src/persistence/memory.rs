// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence, for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{ActivityResult, HistoryEvent, InstanceRecord, InstanceStatus};

use super::{DurableStore, check_append, check_transition};

struct StoredInstance {
    record: InstanceRecord,
    history: Vec<HistoryEvent>,
}

/// Process-local [`DurableStore`]. State is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStore {
    instances: Mutex<HashMap<String, StoredInstance>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, HashMap<String, StoredInstance>>, CoreError> {
        self.instances.lock().map_err(|_| CoreError::DatabaseError {
            operation: "lock".to_string(),
            details: "in-memory store mutex poisoned".to_string(),
        })
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn create_instance(
        &self,
        instance_id: &str,
        orchestrator_name: &str,
        input: &Value,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        if state.contains_key(instance_id) {
            return Err(CoreError::InstanceAlreadyExists {
                instance_id: instance_id.to_string(),
            });
        }
        state.insert(
            instance_id.to_string(),
            StoredInstance {
                record: InstanceRecord::pending(instance_id, orchestrator_name, input.clone()),
                history: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        Ok(self.state()?.get(instance_id).map(|s| s.record.clone()))
    }

    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, CoreError> {
        self.state()?
            .get(instance_id)
            .map(|s| s.history.clone())
            .ok_or_else(|| CoreError::not_found(instance_id))
    }

    async fn append_event(&self, instance_id: &str, event: &HistoryEvent) -> Result<(), CoreError> {
        let mut state = self.state()?;
        let stored = state
            .get_mut(instance_id)
            .ok_or_else(|| CoreError::not_found(instance_id))?;
        check_append(instance_id, stored.record.status, stored.history.len(), event)?;
        stored.history.push(event.clone());
        Ok(())
    }

    async fn complete_event(
        &self,
        instance_id: &str,
        sequence_index: u32,
        result: &ActivityResult,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        let stored = state
            .get_mut(instance_id)
            .ok_or_else(|| CoreError::not_found(instance_id))?;
        let event = stored
            .history
            .get_mut(sequence_index as usize)
            .ok_or_else(|| CoreError::EventNotFound {
                instance_id: instance_id.to_string(),
                sequence_index,
            })?;
        if event.result.is_some() {
            return Err(CoreError::ResultAlreadyRecorded {
                instance_id: instance_id.to_string(),
                sequence_index,
            });
        }
        event.result = Some(result.clone());
        event.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn set_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        let record = &mut state
            .get_mut(instance_id)
            .ok_or_else(|| CoreError::not_found(instance_id))?
            .record;
        check_transition(instance_id, record.status, status, error)?;

        let now = Utc::now();
        record.status = status;
        record.updated_at = now;
        match status {
            InstanceStatus::Completed => {
                record.output = Some(output.cloned().unwrap_or(Value::Null));
                record.finished_at = Some(now);
            }
            InstanceStatus::Failed => {
                record.error = error.map(str::to_string);
                record.finished_at = Some(now);
            }
            InstanceStatus::Pending | InstanceStatus::Running => {}
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let state = self.state()?;
        let mut records: Vec<InstanceRecord> = state
            .values()
            .filter(|s| status.is_none_or(|wanted| s.record.status == wanted))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(self.instances.lock().is_ok())
    }
}
