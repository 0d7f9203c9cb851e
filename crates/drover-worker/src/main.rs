// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drover Worker
//!
//! Reads one message per line from stdin and starts the configured
//! orchestration for each. Unfinished instances left behind by a previous
//! process are resumed before the first message is read.

mod handlers;

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use drover_core::{Config, InboundMessage, Runtime, SqliteStore};

const CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("drover_core=info,drover_worker=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Drover worker");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database = %config.database_path.display(),
        orchestrator = %config.orchestrator_name,
        max_activities = config.max_concurrent_activities,
        "Configuration loaded"
    );

    let store = Arc::new(SqliteStore::from_path(&config.database_path).await?);
    info!("Database ready");

    let runtime = Runtime::builder()
        .store(store.clone())
        .orchestrations(handlers::orchestrations(&config.orchestrator_name)?)
        .activities(handlers::activities()?)
        .max_concurrent_activities(config.max_concurrent_activities)
        .build()?;

    let resumed = runtime.recover().await?;
    if resumed > 0 {
        info!(resumed, "Resumed running instances");
    }

    let trigger = runtime.trigger(config.orchestrator_name.clone());
    let shutdown = trigger.shutdown_handle();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).split(b'\n');
        loop {
            match lines.next_segment().await {
                Ok(Some(mut line)) => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(InboundMessage::new(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read from stdin");
                    break;
                }
            }
        }
    });

    let run = trigger.run(rx);
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {
            // Instances started from the input keep running until interrupted.
            info!("Input closed, waiting for shutdown signal");
            tokio::signal::ctrl_c().await?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            shutdown.notify_one();
            run.await;
        }
    }
    info!("Shutting down...");
    reader.abort();

    store.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
