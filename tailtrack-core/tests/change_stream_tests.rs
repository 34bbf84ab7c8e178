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

//! Change stream consumption against an in-memory log.

mod common;

use bson::{doc, Bson};
use common::{init_tracing, TestStore};
use std::sync::Arc;
use std::time::Duration;
use tailtrack_core::config::SubscriptionConfigBuilder;
use tailtrack_core::consumer::{ConsumerError, ConsumerState, TailConsumer};
use tailtrack_core::handler::CollectingHandler;
use tailtrack_core::source::{MemoryLog, SourceError};
use tailtrack_core::{ConsumerType, OperationType, Position, PositionStore, SourcePosition, SubscriptionConfig};

const WAIT: Duration = Duration::from_secs(10);

fn change_streams(collection: &str, id: &str) -> SubscriptionConfigBuilder {
    SubscriptionConfig::builder()
        .collection(collection)
        .consumer_type(ConsumerType::ChangeStreams)
        .persistent(true)
        .persistent_id(id)
        .poll_timeout(Duration::from_millis(20))
        .initial_backoff_ms(5)
        .max_backoff_ms(50)
        .backoff_jitter(0.0)
}

async fn start_running(
    config: SubscriptionConfig,
    log: &MemoryLog,
    store: &Arc<TestStore>,
    handler: &CollectingHandler,
) -> TailConsumer {
    let consumer = TailConsumer::start(
        config,
        Arc::new(log.change_stream()),
        store.clone(),
        Box::new(handler.clone()),
    );
    assert!(consumer.wait_for_state(ConsumerState::Running, WAIT).await);
    consumer
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_insert_update_delete() {
    init_tracing();
    let log = MemoryLog::new("orders");
    let store = TestStore::new();
    let handler = CollectingHandler::new();

    let mut consumer = start_running(
        change_streams("orders", "ops").build().unwrap(),
        &log,
        &store,
        &handler,
    )
    .await;

    let id = log.insert(doc! { "status": "open", "total": 10 }).await;
    log.update(id.clone(), doc! { "status": "paid", "total": 10 })
        .await;
    log.delete(id.clone()).await;

    assert!(handler.wait_for(3, WAIT).await);
    let stats = consumer.stop().await.unwrap();
    let events = handler.events().await;

    let operations: Vec<_> = events.iter().filter_map(|e| e.operation.clone()).collect();
    assert_eq!(
        operations,
        vec![
            OperationType::Insert,
            OperationType::Update,
            OperationType::Delete
        ]
    );
    assert_eq!(events[1].payload.get_str("status").unwrap(), "paid");
    // Deletes only carry the document key.
    assert_eq!(events[2].payload, doc! { "_id": id.clone() });
    assert!(events.iter().all(|e| e.id.as_ref() == Some(&id)));
    assert!(events
        .iter()
        .all(|e| matches!(e.source_position, SourcePosition::ResumeToken(_))));

    assert_eq!(stats.events_delivered, 3);
    let stored = store.list().await.unwrap();
    assert_eq!(
        stored["ops"].last_value,
        events[2].source_position,
        "stored token is the last delivered one"
    );
    assert_eq!(stored["ops"].tracking_field, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_filter_on_operation_type() {
    let log = MemoryLog::new("orders");
    let store = TestStore::new();
    let handler = CollectingHandler::new();

    let mut consumer = start_running(
        change_streams("orders", "filtered")
            .stream_filter(r#"{"operationType": {"$in": ["insert", "delete"]}}"#)
            .build()
            .unwrap(),
        &log,
        &store,
        &handler,
    )
    .await;

    let first = log.insert(doc! { "n": 1 }).await;
    log.update(first.clone(), doc! { "n": 2 }).await;
    log.delete(first).await;
    let last = log.insert(doc! { "n": 3 }).await;
    log.update(last, doc! { "n": 4 }).await;

    assert!(handler.wait_for(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = consumer.stop().await.unwrap();

    let operations: Vec<_> = handler
        .events()
        .await
        .iter()
        .filter_map(|e| e.operation.clone())
        .collect();
    assert_eq!(
        operations,
        vec![
            OperationType::Insert,
            OperationType::Delete,
            OperationType::Insert
        ]
    );
    assert_eq!(stats.events_filtered, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_filtered_events_advance_token_across_restart() {
    let log = MemoryLog::new("orders");
    let store = TestStore::new();
    let config = || {
        change_streams("orders", "inserts-only")
            .stream_filter(r#"{"operationType": "insert"}"#)
            .build()
            .unwrap()
    };

    let first = CollectingHandler::new();
    let mut consumer = start_running(config(), &log, &store, &first).await;
    let a = log.insert(doc! { "name": "a" }).await;
    log.update(a.clone(), doc! { "name": "a1" }).await;

    assert!(first.wait_for(1, WAIT).await);
    let deadline = tokio::time::Instant::now() + WAIT;
    while consumer.stats().await.events_filtered < 1 {
        assert!(tokio::time::Instant::now() < deadline, "update never filtered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = consumer.stop().await.unwrap();

    // The trailing filtered update moved the stored token past the insert.
    let stored = store.load("inserts-only").await.unwrap().unwrap();
    let delivered = first.events().await;
    assert_ne!(stored.last_value, delivered[0].source_position);
    assert_eq!(Some(stored.last_value), stats.last_position);

    log.update(a, doc! { "name": "a2" }).await;
    log.insert(doc! { "name": "b" }).await;

    let second = CollectingHandler::new();
    let mut consumer = start_running(config(), &log, &store, &second).await;
    assert!(second.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = consumer.stop().await.unwrap();

    let events = second.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, Some(OperationType::Insert));
    assert_eq!(events[0].payload.get_str("name").unwrap(), "b");
    // Only the update written while stopped is seen again.
    assert_eq!(stats.events_filtered, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_filter_on_full_document() {
    let log = MemoryLog::new("orders");
    let store = TestStore::new();
    let handler = CollectingHandler::new();

    let mut consumer = start_running(
        change_streams("orders", "open-orders")
            .stream_filter(r#"{"fullDocument.status": "open"}"#)
            .build()
            .unwrap(),
        &log,
        &store,
        &handler,
    )
    .await;

    log.insert(doc! { "status": "open", "n": 1 }).await;
    log.insert(doc! { "status": "closed", "n": 2 }).await;
    log.insert(doc! { "status": "open", "n": 3 }).await;

    assert!(handler.wait_for(2, WAIT).await);
    consumer.stop().await.unwrap();

    let numbers: Vec<i32> = handler
        .events()
        .await
        .iter()
        .map(|e| e.payload.get_i32("n").unwrap())
        .collect();
    assert_eq!(numbers, vec![1, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resumes_after_stored_token() {
    let log = MemoryLog::new("orders");
    let store = TestStore::new();

    let first = CollectingHandler::new();
    let mut consumer = start_running(
        change_streams("orders", "resume").build().unwrap(),
        &log,
        &store,
        &first,
    )
    .await;
    let a = log.insert(doc! { "name": "a" }).await;
    log.insert(doc! { "name": "b" }).await;
    assert!(first.wait_for(2, WAIT).await);
    consumer.stop().await.unwrap();

    // Written while nothing is consuming.
    log.insert(doc! { "name": "c" }).await;
    log.update(a, doc! { "name": "a2" }).await;

    let second = CollectingHandler::new();
    let mut consumer = TailConsumer::start(
        change_streams("orders", "resume").build().unwrap(),
        Arc::new(log.change_stream()),
        store.clone(),
        Box::new(second.clone()),
    );
    assert!(second.wait_for(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.stop().await.unwrap();

    let names: Vec<String> = second
        .events()
        .await
        .iter()
        .map(|e| e.payload.get_str("name").unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["c", "a2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_resume_token_is_fatal() {
    let log = MemoryLog::new("orders");
    log.insert(doc! { "n": 1 }).await;
    let store = TestStore::new();
    store
        .save(&Position::new(
            "stale",
            None,
            SourcePosition::ResumeToken(doc! { "_data": "00000000000000ff" }),
        ))
        .await
        .unwrap();

    let mut consumer = TailConsumer::start(
        change_streams("orders", "stale").build().unwrap(),
        Arc::new(log.change_stream()),
        store.clone(),
        Box::new(CollectingHandler::new()),
    );

    let err = consumer.wait().await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::Source(SourceError::InvalidResumeToken { code: 286 })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stored_field_value_rejected() {
    let log = MemoryLog::new("orders");
    let store = TestStore::new();
    store
        .save(&Position::new(
            "mixed",
            Some("increasing".to_string()),
            SourcePosition::Value(Bson::Int32(5)),
        ))
        .await
        .unwrap();

    let mut consumer = TailConsumer::start(
        change_streams("orders", "mixed").build().unwrap(),
        Arc::new(log.change_stream()),
        store.clone(),
        Box::new(CollectingHandler::new()),
    );

    let err = consumer.wait().await.unwrap_err();
    assert!(matches!(err, ConsumerError::Configuration(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_invalidates_stream() {
    let log = MemoryLog::new("orders");
    let store = TestStore::new();
    let handler = CollectingHandler::new();

    let mut consumer = start_running(
        change_streams("orders", "dropped").build().unwrap(),
        &log,
        &store,
        &handler,
    )
    .await;

    log.insert(doc! { "n": 1 }).await;
    log.drop_collection().await;

    let err = consumer.wait().await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::Source(SourceError::Invalidated { .. })
    ));

    let operations: Vec<_> = handler
        .events()
        .await
        .iter()
        .filter_map(|e| e.operation.clone())
        .collect();
    assert_eq!(operations, vec![OperationType::Insert, OperationType::Drop]);
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}
