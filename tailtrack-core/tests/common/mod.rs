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

//! Shared helpers for integration tests.

#![allow(dead_code)]

use bson::Bson;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tailtrack_core::config::{SubscriptionConfig, SubscriptionConfigBuilder};
use tailtrack_core::event::{Event, SourcePosition};
use tailtrack_core::position::Position;
use tailtrack_core::state::{PositionStore, StoreError};
use tokio::sync::Mutex;

/// In-memory position store with failure injection and a save history.
#[derive(Default)]
pub struct TestStore {
    positions: Mutex<HashMap<String, Position>>,
    history: Mutex<Vec<Position>>,
    failing_saves: AtomicU32,
    failing_loads: AtomicBool,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `count` saves fail.
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Makes every load fail.
    pub fn fail_loads(&self, fail: bool) {
        self.failing_loads.store(fail, Ordering::SeqCst);
    }

    /// Every successfully saved position, in order.
    pub async fn history(&self) -> Vec<Position> {
        self.history.lock().await.clone()
    }

    /// Stored tracking value for a subscriber, if it is a field value.
    pub async fn value(&self, subscriber_id: &str) -> Option<Bson> {
        self.positions
            .lock()
            .await
            .get(subscriber_id)
            .and_then(|p| p.last_value.as_value().cloned())
    }

    /// Waits until the stored value for `subscriber_id` equals `expected`.
    pub async fn wait_for_value(&self, subscriber_id: &str, expected: Bson, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.value(subscriber_id).await.as_ref() == Some(&expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[async_trait::async_trait]
impl PositionStore for TestStore {
    async fn load(&self, subscriber_id: &str) -> Result<Option<Position>, StoreError> {
        if self.failing_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected load failure".into()));
        }
        Ok(self.positions.lock().await.get(subscriber_id).cloned())
    }

    async fn save(&self, position: &Position) -> Result<(), StoreError> {
        let remaining = self.failing_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("injected save failure".into()));
        }
        self.positions
            .lock()
            .await
            .insert(position.subscriber_id.clone(), position.clone());
        self.history.lock().await.push(position.clone());
        Ok(())
    }

    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError> {
        self.positions.lock().await.remove(subscriber_id);
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, Position>, StoreError> {
        Ok(self.positions.lock().await.clone())
    }
}

/// Fast-polling persistent tailable configuration on `increasing`.
pub fn tailable(collection: &str, id: &str) -> SubscriptionConfigBuilder {
    SubscriptionConfig::builder()
        .collection(collection)
        .tracking_field("increasing")
        .persistent(true)
        .persistent_id(id)
        .poll_timeout(Duration::from_millis(20))
        .initial_backoff_ms(5)
        .max_backoff_ms(50)
        .backoff_jitter(0.0)
        .open_timeout(Duration::from_secs(5))
}

/// The `increasing` values of delivered events.
pub fn increasing(events: &[Event]) -> Vec<i64> {
    events
        .iter()
        .map(|e| match &e.source_position {
            SourcePosition::Value(Bson::Int32(v)) => i64::from(*v),
            SourcePosition::Value(Bson::Int64(v)) => *v,
            other => panic!("unexpected position {other}"),
        })
        .collect()
}

/// Opt into log output with `RUST_LOG=tailtrack_core=debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
