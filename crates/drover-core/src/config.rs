// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;

/// Default orchestration started for every inbound message.
pub const DEFAULT_ORCHESTRATOR: &str = "DurableFunctionsOrchestrator";

/// Drover worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file holding instances and history
    pub database_path: PathBuf,
    /// Orchestration started for each inbound message
    pub orchestrator_name: String,
    /// Maximum number of activities executing at once
    pub max_concurrent_activities: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `DROVER_DATABASE_PATH`: SQLite database file (default: `.data/drover.db`)
    /// - `DROVER_ORCHESTRATOR`: orchestration started per message
    ///   (default: `DurableFunctionsOrchestrator`)
    /// - `DROVER_MAX_CONCURRENT_ACTIVITIES`: dispatcher concurrency bound (default: 32)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("DROVER_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data/drover.db"));

        let orchestrator_name = std::env::var("DROVER_ORCHESTRATOR")
            .unwrap_or_else(|_| DEFAULT_ORCHESTRATOR.to_string());
        if orchestrator_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "DROVER_ORCHESTRATOR",
                "must not be empty",
            ));
        }

        let max_concurrent_activities: usize = std::env::var("DROVER_MAX_CONCURRENT_ACTIVITIES")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "DROVER_MAX_CONCURRENT_ACTIVITIES",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_path,
            orchestrator_name,
            max_concurrent_activities,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
