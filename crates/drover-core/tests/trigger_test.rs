// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the queue trigger adapter.

mod common;

use std::sync::Arc;

use common::*;
use drover_core::{InMemoryStore, InboundMessage, InstanceStatus, TriggerError};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_message_starts_orchestration() {
    let invocations = Invocations::default();
    let runtime = runtime(Arc::new(InMemoryStore::new()), &invocations, &Gate::closed());
    let trigger = runtime.trigger("Orchestrator");

    let instance_id = trigger
        .handle_message(InboundMessage::new("hello"))
        .await
        .expect("message should start an instance");

    let state = wait_terminal(&runtime, &instance_id).await;
    assert_eq!(state.orchestrator_name, "Orchestrator");
    assert_eq!(state.output, Some(json!("Processed message: hello")));
}

#[tokio::test]
async fn test_undecodable_message_is_rejected() {
    let invocations = Invocations::default();
    let runtime = runtime(Arc::new(InMemoryStore::new()), &invocations, &Gate::closed());
    let trigger = runtime.trigger("Orchestrator");

    let err = trigger
        .handle_message(InboundMessage::new(vec![0xff, 0xfe, 0x00]))
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::Decode(_)));

    let all = runtime.instances().list_instances(None, 10, 0).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn test_redelivered_message_is_deduplicated() {
    let invocations = Invocations::default();
    let runtime = runtime(Arc::new(InMemoryStore::new()), &invocations, &Gate::closed());
    let trigger = runtime.trigger("Orchestrator");

    let message = InboundMessage::new("hello").with_message_id("msg-42");
    let first = trigger.handle_message(message.clone()).await.unwrap();
    let second = trigger.handle_message(message).await.unwrap();

    assert_eq!(first, "msg-42");
    assert_eq!(second, "msg-42");
    wait_terminal(&runtime, &first).await;

    let all = runtime.instances().list_instances(None, 10, 0).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(invocations.get("ProcessMessage"), 1);
}

#[tokio::test]
async fn test_unknown_orchestrator_is_reported() {
    let invocations = Invocations::default();
    let runtime = runtime(Arc::new(InMemoryStore::new()), &invocations, &Gate::closed());
    let trigger = runtime.trigger("Missing");

    let err = trigger
        .handle_message(InboundMessage::new("hello"))
        .await
        .unwrap_err();
    match err {
        TriggerError::Start(core) => assert_eq!(core.error_code(), "UNKNOWN_ORCHESTRATION"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_run_loop_drains_channel_until_closed() {
    let invocations = Invocations::default();
    let runtime = runtime(Arc::new(InMemoryStore::new()), &invocations, &Gate::closed());
    let trigger = runtime.trigger("Orchestrator");

    let (tx, rx) = mpsc::channel(8);
    tx.send(InboundMessage::new("one")).await.unwrap();
    tx.send(InboundMessage::new(vec![0xc3, 0x28])).await.unwrap();
    tx.send(InboundMessage::new("two")).await.unwrap();
    drop(tx);

    // Returns once the channel is closed and drained; bad messages do not stop it.
    trigger.run(rx).await;

    let all = runtime.instances().list_instances(None, 10, 0).await.unwrap();
    assert_eq!(all.len(), 2);
    for state in all {
        let done = wait_terminal(&runtime, &state.instance_id).await;
        assert_eq!(done.status, InstanceStatus::Completed);
    }
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let invocations = Invocations::default();
    let runtime = runtime(Arc::new(InMemoryStore::new()), &invocations, &Gate::closed());
    let trigger = runtime.trigger("Orchestrator");
    let shutdown = trigger.shutdown_handle();

    let (tx, rx) = mpsc::channel(8);
    let handle = tokio::spawn(async move { trigger.run(rx).await });

    tx.send(InboundMessage::new("before shutdown")).await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            let all = runtime.instances().list_instances(None, 10, 0).await.unwrap();
            if !all.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message should be handled");

    shutdown.notify_one();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("trigger loop should stop")
        .expect("trigger task");

    // The sender was still alive; shutdown alone ended the loop.
    drop(tx);
}
