// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrations and activities hosted by the worker.

use anyhow::Context;
use drover_core::{ActivityRegistry, CoreError, OrchestrationContext, OrchestrationRegistry};
use serde_json::{Value, json};
use tracing::info;

/// Activity invoked once per inbound message.
pub const PROCESS_MESSAGE: &str = "ProcessMessage";

/// Orchestrations, with the message orchestration registered under `orchestrator_name`.
pub fn orchestrations(orchestrator_name: &str) -> Result<OrchestrationRegistry, CoreError> {
    OrchestrationRegistry::builder()
        .register(orchestrator_name, |ctx: &mut OrchestrationContext| {
            let message = ctx.input().clone();
            ctx.call_activity(PROCESS_MESSAGE, message)
        })
        .build()
}

/// Activities available to the worker's orchestrations.
pub fn activities() -> Result<ActivityRegistry, CoreError> {
    ActivityRegistry::builder()
        .register(PROCESS_MESSAGE, process_message)
        .build()
}

async fn process_message(input: Value) -> anyhow::Result<Value> {
    let message = input
        .as_str()
        .context("ProcessMessage expects a text message")?;
    info!(message = %message, "Processing message");
    Ok(json!(format!("Processed message: {message}")))
}
