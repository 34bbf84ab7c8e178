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

//! MongoDB integration tests.
//!
//! These need a MongoDB replica set (change streams are unavailable on a
//! standalone server):
//! ```bash
//! MONGODB_URI=mongodb://localhost:27017/?replicaSet=rs0 \
//!     cargo test -p tailtrack-stores --test mongo_integration_test -- --ignored
//! ```

#![cfg(feature = "mongo")]

use bson::{doc, Bson, Document};
use mongodb::options::CreateCollectionOptions;
use mongodb::{Client, Database};
use std::sync::Arc;
use std::time::Duration;
use tailtrack_core::config::TrackingStoreLocation;
use tailtrack_core::handler::CollectingHandler;
use tailtrack_core::source::{source_for, ChangeStreamSource};
use tailtrack_core::{
    ConsumerState, ConsumerType, LifecycleController, Position, PositionStore, SourcePosition,
    SubscriptionConfig,
};
use tailtrack_stores::mongo::MongoPositionStore;

const WAIT: Duration = Duration::from_secs(20);

async fn test_database(name: &str) -> Database {
    let uri = std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".into());
    let client = Client::with_uri_str(&uri).await.expect("MongoDB client");
    let database = client.database(name);
    database.drop().await.expect("drop test database");
    database
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_tracking_document_shape() {
    let database = test_database("tailtrack_store_shape").await;
    let location = TrackingStoreLocation {
        field: "lastSeen".to_string(),
        ..TrackingStoreLocation::default()
    };
    let store = MongoPositionStore::new(&database, &location);
    store.ensure_indexes().await.unwrap();

    let position = Position::new(
        "orders-feed",
        Some("seq".to_string()),
        SourcePosition::Value(Bson::Int64(42)),
    );
    store.save(&position).await.unwrap();
    store.save(&position).await.unwrap();

    let raw: Vec<Document> = {
        use futures::TryStreamExt;
        database
            .collection::<Document>("tailTracking")
            .find(doc! {})
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    };
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].get_str("persistentId").unwrap(), "orders-feed");
    assert_eq!(raw[0].get_str("trackingField").unwrap(), "seq");
    assert_eq!(raw[0].get_i64("lastSeen").unwrap(), 42);

    let loaded = store.load("orders-feed").await.unwrap().unwrap();
    assert_eq!(loaded.last_value, position.last_value);
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_separate_tracking_database() {
    let source = test_database("tailtrack_store_source").await;
    let tracking = test_database("tailtrack_store_tracking").await;

    let location = TrackingStoreLocation {
        database: Some(tracking.name().to_string()),
        ..TrackingStoreLocation::default()
    };
    let store = MongoPositionStore::new(&source, &location);
    store
        .save(&Position::new("feed", None, SourcePosition::ResumeToken(doc! { "_data": "82" })))
        .await
        .unwrap();

    let count = tracking
        .collection::<Document>("tailTracking")
        .count_documents(doc! {})
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn test_lock_between_owners() {
    let database = test_database("tailtrack_store_locks").await;
    let store = MongoPositionStore::new(&database, &TrackingStoreLocation::default());
    let ttl = Duration::from_secs(5);

    assert!(store.try_acquire_lock("tailtrack:lock:feed", "a", ttl).await.unwrap());
    assert!(store.try_acquire_lock("tailtrack:lock:feed", "a", ttl).await.unwrap());
    assert!(!store.try_acquire_lock("tailtrack:lock:feed", "b", ttl).await.unwrap());
    assert!(store.refresh_lock("tailtrack:lock:feed", "a", ttl).await.unwrap());
    assert!(store.release_lock("tailtrack:lock:feed", "a").await.unwrap());
    assert!(store.try_acquire_lock("tailtrack:lock:feed", "b", ttl).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore] // Requires MongoDB
async fn test_tailable_capped_collection_resumes() {
    let database = test_database("tailtrack_tailable").await;
    database
        .create_collection("capped")
        .with_options(
            CreateCollectionOptions::builder()
                .capped(true)
                .size(1024 * 1024)
                .build(),
        )
        .await
        .unwrap();
    let collection = database.collection::<Document>("capped");
    for i in 1..=5 {
        collection.insert_one(doc! { "increasing": i }).await.unwrap();
    }

    let store = Arc::new(MongoPositionStore::new(&database, &TrackingStoreLocation::default()));
    let config = || {
        SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .persistent(true)
            .persistent_id("capped-feed")
            .poll_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    };
    let source = || source_for(&database, &config()).unwrap();

    let controller = LifecycleController::new(store.clone());
    let first = CollectingHandler::new();
    controller
        .start(config(), source(), Box::new(first.clone()))
        .await
        .unwrap();
    assert!(first.wait_for(5, WAIT).await);
    controller.stop("capped-feed").await.unwrap();

    for i in 6..=8 {
        collection.insert_one(doc! { "increasing": i }).await.unwrap();
    }

    let second = CollectingHandler::new();
    controller
        .start(config(), source(), Box::new(second.clone()))
        .await
        .unwrap();
    assert!(second.wait_for(3, WAIT).await);
    controller.stop("capped-feed").await.unwrap();

    let delivered: Vec<i32> = second
        .events()
        .await
        .iter()
        .map(|e| e.payload.get_i32("increasing").unwrap())
        .collect();
    assert_eq!(delivered, vec![6, 7, 8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore] // Requires a MongoDB replica set
async fn test_change_stream_delete_carries_key_only() {
    let database = test_database("tailtrack_change_stream").await;
    let collection = database.collection::<Document>("orders");
    database.create_collection("orders").await.unwrap();

    let store = Arc::new(MongoPositionStore::new(&database, &TrackingStoreLocation::default()));
    let controller = LifecycleController::new(store);
    let handler = CollectingHandler::new();
    let config = SubscriptionConfig::builder()
        .collection("orders")
        .consumer_type(ConsumerType::ChangeStreams)
        .persistent(true)
        .persistent_id("orders-stream")
        .poll_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    controller
        .start(
            config,
            Arc::new(ChangeStreamSource::new(collection.clone())),
            Box::new(handler.clone()),
        )
        .await
        .unwrap();
    assert!(
        controller
            .wait_for_state("orders-stream", ConsumerState::Running, WAIT)
            .await
    );

    let id = collection
        .insert_one(doc! { "status": "open" })
        .await
        .unwrap()
        .inserted_id;
    collection
        .update_one(doc! { "_id": &id }, doc! { "$set": { "status": "paid" } })
        .await
        .unwrap();
    collection.delete_one(doc! { "_id": &id }).await.unwrap();

    assert!(handler.wait_for(3, WAIT).await);
    controller.stop("orders-stream").await.unwrap();

    let events = handler.events().await;
    assert!(events[0].is_insert());
    assert!(events[1].is_update());
    assert_eq!(events[1].payload.get_str("status").unwrap(), "paid");
    assert!(events[2].is_delete());
    assert_eq!(events[2].payload, doc! { "_id": id });
}
