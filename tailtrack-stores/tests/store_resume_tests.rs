// Copyright 2025 Tailtrack Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Subscriptions resuming from stores across controller restarts.

#![cfg(all(feature = "file", feature = "memory"))]

use bson::{doc, Bson};
use std::sync::Arc;
use std::time::Duration;
use tailtrack_core::consumer::ConsumerError;
use tailtrack_core::handler::CollectingHandler;
use tailtrack_core::source::MemoryLog;
use tailtrack_core::{ConsumerState, LifecycleController, PositionStore, SourcePosition, SubscriptionConfig};
use tailtrack_stores::file::FileStore;
use tailtrack_stores::memory::MemoryStore;

const WAIT: Duration = Duration::from_secs(10);

fn config(id: &str) -> SubscriptionConfig {
    SubscriptionConfig::builder()
        .collection("capped")
        .tracking_field("increasing")
        .persistent(true)
        .persistent_id(id)
        .poll_timeout(Duration::from_millis(20))
        .initial_backoff_ms(5)
        .backoff_jitter(0.0)
        .build()
        .unwrap()
}

fn values(events: &[tailtrack_core::Event]) -> Vec<i32> {
    events
        .iter()
        .map(|e| e.payload.get_i32("increasing").unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("positions.json");
    let log = MemoryLog::new("capped");
    for i in 1..=5 {
        log.insert(doc! { "increasing": i }).await;
    }

    {
        let store = FileStore::open(&path).await.unwrap();
        let controller = LifecycleController::new(Arc::new(store));
        let handler = CollectingHandler::new();
        controller
            .start(config("durable"), Arc::new(log.tailable("increasing")), Box::new(handler.clone()))
            .await
            .unwrap();
        assert!(handler.wait_for(5, WAIT).await);
        controller.stop("durable").await.unwrap();
        assert_eq!(values(&handler.events().await), vec![1, 2, 3, 4, 5]);
    }

    for i in 6..=8 {
        log.insert(doc! { "increasing": i }).await;
    }

    // A fresh store instance only knows what is on disk.
    let store = Arc::new(FileStore::open(&path).await.unwrap());
    let stored = store.load("durable").await.unwrap().unwrap();
    assert_eq!(stored.last_value, SourcePosition::Value(Bson::Int32(5)));

    let controller = LifecycleController::new(store.clone());
    let handler = CollectingHandler::new();
    controller
        .start(config("durable"), Arc::new(log.tailable("increasing")), Box::new(handler.clone()))
        .await
        .unwrap();
    assert!(handler.wait_for(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.stop("durable").await.unwrap();

    assert_eq!(values(&handler.events().await), vec![6, 7, 8]);
    assert_eq!(
        store.load("durable").await.unwrap().unwrap().last_value,
        SourcePosition::Value(Bson::Int32(8))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_prevents_second_instance() {
    let log = MemoryLog::new("capped");
    let store = MemoryStore::new();
    let first = LifecycleController::with_owner_id(Arc::new(store.clone()), "instance-a");
    let second = LifecycleController::with_owner_id(Arc::new(store.clone()), "instance-b");

    first
        .start(config("shared"), Arc::new(log.tailable("increasing")), Box::new(CollectingHandler::new()))
        .await
        .unwrap();
    assert!(first.wait_for_state("shared", ConsumerState::Running, WAIT).await);

    let err = second
        .start(config("shared"), Arc::new(log.tailable("increasing")), Box::new(CollectingHandler::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::LockHeld(_)));

    first.stop("shared").await.unwrap();
    assert!(!store.is_locked("tailtrack:lock:shared").await.unwrap());

    second
        .start(config("shared"), Arc::new(log.tailable("increasing")), Box::new(CollectingHandler::new()))
        .await
        .unwrap();
    second.stop("shared").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_persistent_subscription_takes_no_lock() {
    let log = MemoryLog::new("capped");
    let store = MemoryStore::new();
    let controller = LifecycleController::new(Arc::new(store.clone()));

    let config = SubscriptionConfig::builder()
        .collection("capped")
        .tracking_field("increasing")
        .poll_timeout(Duration::from_millis(20))
        .build()
        .unwrap();
    controller
        .start(config, Arc::new(log.tailable("increasing")), Box::new(CollectingHandler::new()))
        .await
        .unwrap();

    assert!(!store.is_locked("tailtrack:lock:capped").await.unwrap());
    controller.stop("capped").await.unwrap();
    assert!(store.is_empty().await);
}

/// Short-lease configuration whose backoff sleeps outlast the lease.
fn short_lease(id: &str) -> SubscriptionConfig {
    SubscriptionConfig::builder()
        .collection("capped")
        .tracking_field("increasing")
        .persistent(true)
        .persistent_id(id)
        .poll_timeout(Duration::from_millis(20))
        .lock_ttl(Duration::from_millis(150))
        .initial_backoff_ms(5)
        .max_backoff_ms(1000)
        .backoff_jitter(0.0)
        .open_timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_held_while_waiting_for_source() {
    let log = MemoryLog::missing("capped");
    let store = MemoryStore::new();
    let first = LifecycleController::with_owner_id(Arc::new(store.clone()), "instance-a");
    let second = LifecycleController::with_owner_id(Arc::new(store.clone()), "instance-b");
    let handler = CollectingHandler::new();

    first
        .start(short_lease("waiting"), Arc::new(log.tailable("increasing")), Box::new(handler.clone()))
        .await
        .unwrap();

    // Several lease lifetimes pass while the collection does not exist.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(first.status("waiting").await, ConsumerState::Starting);

    let err = second
        .start(short_lease("waiting"), Arc::new(log.tailable("increasing")), Box::new(CollectingHandler::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::LockHeld(_)));

    log.insert(doc! { "increasing": 1 }).await;
    assert!(handler.wait_for(1, WAIT).await);
    first.stop("waiting").await.unwrap();
    assert_eq!(values(&handler.events().await), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_held_during_reconnect_backoff() {
    let log = MemoryLog::new("capped");
    log.fail_next_reads(2).await;
    let store = MemoryStore::new();
    let first = LifecycleController::with_owner_id(Arc::new(store.clone()), "instance-a");
    let second = LifecycleController::with_owner_id(Arc::new(store.clone()), "instance-b");
    let handler = CollectingHandler::new();

    let config = || {
        SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .persistent(true)
            .persistent_id("backoff")
            .poll_timeout(Duration::from_millis(20))
            .lock_ttl(Duration::from_millis(150))
            .initial_backoff_ms(400)
            .max_backoff_ms(1000)
            .backoff_jitter(0.0)
            .max_reconnect_attempts(0)
            .build()
            .unwrap()
    };

    first
        .start(config(), Arc::new(log.tailable("increasing")), Box::new(handler.clone()))
        .await
        .unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let err = second
            .start(config(), Arc::new(log.tailable("increasing")), Box::new(CollectingHandler::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::LockHeld(_)));
    }

    log.insert(doc! { "increasing": 1 }).await;
    assert!(handler.wait_for(1, WAIT).await);
    let stats = first.stop("backoff").await.unwrap();
    assert!(stats.reconnects >= 2);
    assert_eq!(handler.len().await, 1);
}
