// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drover Core - Durable Orchestration Engine
//!
//! This crate executes orchestration functions whose steps call out to
//! activities. Progress is persisted as a per-instance history of activity
//! calls, so a crash or restart resumes where it left off and replaying an
//! orchestration never re-executes work that already has a recorded result.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   Trigger Adapter    │  inbound message ──► StartNew(orchestrator, text)
//! └──────────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │   Instance Manager   │  create, status queries, recovery
//! └──────────────────────┘
//!            │ run(instance_id)
//!            ▼
//! ┌──────────────────────┐        spawn         ┌──────────────────────┐
//! │ Orchestration Engine │ ───────────────────► │ Activity Dispatcher  │
//! │   (replay passes)    │ ◄─── run(id) ─────── │  (bounded tasks)     │
//! └──────────────────────┘   after complete     └──────────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │    Durable Store     │  in-memory or SQLite
//! └──────────────────────┘
//! ```
//!
//! # Replay
//!
//! | Situation at the current index | Result of `call_activity` |
//! |--------------------------------|---------------------------|
//! | event with a completed result  | the recorded value        |
//! | event with a failed result     | `ActivityFailed`          |
//! | event without a result         | `Suspended`               |
//! | no event                       | event appended + dispatched, `Suspended` |
//! | event for a different call     | `Nondeterministic` (instance fails) |
//!
//! # Instance Lifecycle
//!
//! ```text
//! Pending ──► Running ──┬──► Completed
//!                       └──► Failed
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DROVER_DATABASE_PATH` | No | `.data/drover.db` | SQLite database file |
//! | `DROVER_ORCHESTRATOR` | No | `DurableFunctionsOrchestrator` | Orchestration started per message |
//! | `DROVER_MAX_CONCURRENT_ACTIVITIES` | No | `32` | Concurrent activity bound |

#![warn(missing_docs)]

/// Configuration loading from environment variables.
pub mod config;
/// Activity dispatcher and handler trait.
pub mod dispatcher;
/// Orchestration engine (replay passes).
pub mod engine;
/// Error types.
pub mod error;
/// Instance manager.
pub mod instances;
/// Database migrations.
pub mod migrations;
/// Instance and history records.
pub mod model;
/// Orchestration functions and replay context.
pub mod orchestration;
/// Durable store trait and backends.
pub mod persistence;
/// Orchestration and activity registries.
pub mod registry;
/// Embeddable runtime.
pub mod runtime;
/// Trigger adapter for inbound messages.
pub mod trigger;

pub use config::{Config, ConfigError};
pub use dispatcher::{ActivityDispatcher, ActivityHandler};
pub use engine::{OrchestrationEngine, RunOutcome};
pub use error::CoreError;
pub use instances::{InstanceManager, InstanceState};
pub use model::{ActivityResult, HistoryEvent, InstanceRecord, InstanceStatus};
pub use orchestration::{OrchestrationContext, OrchestrationError, Orchestrator, RetryPolicy};
pub use persistence::{DurableStore, InMemoryStore, SqliteStore};
pub use registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{Runtime, RuntimeBuilder};
pub use trigger::{InboundMessage, TriggerAdapter, TriggerError};
