// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger adapter: turns inbound queue messages into orchestration instances.
//!
//! The transport itself stays outside the core. Anything that can push
//! [`InboundMessage`]s into a channel (a queue consumer, stdin, a test) can
//! drive [`TriggerAdapter::run`].

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{error, info, instrument};

use crate::error::CoreError;
use crate::instances::InstanceManager;

/// A message received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Transport-assigned ID, used as the instance ID when present.
    pub message_id: Option<String>,
    /// Raw payload, expected to be UTF-8 text.
    pub body: Vec<u8>,
}

impl InboundMessage {
    /// A message without an ID.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: None,
            body: body.into(),
        }
    }

    /// Attach a transport message ID.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Errors reported back to the transport.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The body is not valid UTF-8; no instance was created.
    #[error("message body is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    /// The instance could not be started.
    #[error("failed to start orchestration: {0}")]
    Start(#[from] CoreError),
}

/// Starts one orchestration instance per inbound message.
pub struct TriggerAdapter {
    instances: InstanceManager,
    orchestrator_name: String,
    shutdown: Arc<Notify>,
}

impl TriggerAdapter {
    /// Create an adapter starting `orchestrator_name` for every message.
    pub fn new(instances: InstanceManager, orchestrator_name: impl Into<String>) -> Self {
        Self {
            instances,
            orchestrator_name: orchestrator_name.into(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown of [`TriggerAdapter::run`].
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Decode a message and start an instance for it.
    ///
    /// A message carrying an ID that already started an instance is a
    /// redelivery: nothing new starts, the existing instance is driven
    /// forward if its start was interrupted, and its ID is returned.
    #[instrument(skip(self, message), fields(message_id = ?message.message_id))]
    pub async fn handle_message(&self, message: InboundMessage) -> Result<String, TriggerError> {
        let body = match String::from_utf8(message.body) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Discarding message with undecodable body");
                return Err(e.into());
            }
        };
        info!(body = %body, "Queue message received");

        let started = match message.message_id {
            Some(id) => {
                self.instances
                    .start_new_with_id(&id, &self.orchestrator_name, &body)
                    .await
            }
            None => self.instances.start_new(&self.orchestrator_name, &body).await,
        };

        let instance_id = match started {
            Ok(instance_id) => instance_id,
            Err(CoreError::InstanceAlreadyExists { instance_id }) => {
                info!(instance_id = %instance_id, "Duplicate delivery, driving existing instance");
                // A previous delivery may have stopped before the instance ran.
                if let Err(e) = self.instances.ensure_started(&instance_id).await {
                    error!(error = %e, code = e.error_code(), "Failed to resume existing instance");
                    return Err(e.into());
                }
                return Ok(instance_id);
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Failed to start orchestration");
                return Err(e.into());
            }
        };

        info!(
            instance_id = %instance_id,
            orchestrator = %self.orchestrator_name,
            "Started orchestration"
        );
        Ok(instance_id)
    }

    /// Consume messages until the channel closes or shutdown is signalled.
    pub async fn run(&self, mut messages: mpsc::Receiver<InboundMessage>) {
        info!(orchestrator = %self.orchestrator_name, "Trigger adapter started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Trigger adapter shutting down");
                    break;
                }
                message = messages.recv() => {
                    let Some(message) = message else {
                        info!("Message channel closed");
                        break;
                    };
                    // Errors were logged in handle_message; the loop keeps going.
                    let _ = self.handle_message(message).await;
                }
            }
        }
    }
}
