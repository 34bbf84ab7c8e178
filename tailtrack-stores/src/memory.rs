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

//! In-memory position store.
//!
//! Positions and locks live in process memory and are lost on restart. The
//! store is useful for tests, demos and single-process deployments that can
//! afford to replay from their configured start point.
//!
//! # Example
//!
//! ```rust
//! use tailtrack_core::{Position, PositionStore, SourcePosition};
//! use tailtrack_stores::memory::MemoryStore;
//! use bson::Bson;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//!
//! let position = Position::new(
//!     "orders-feed",
//!     Some("seq".to_string()),
//!     SourcePosition::Value(Bson::Int64(42)),
//! );
//! store.save(&position).await?;
//!
//! let loaded = store.load("orders-feed").await?;
//! assert_eq!(loaded.map(|p| p.last_value), Some(position.last_value));
//! # Ok(())
//! # }
//! ```
//!
//! Clones share the same storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tailtrack_core::{Position, PositionStore, StoreError};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct LockEntry {
    owner_id: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Thread-safe in-memory [`PositionStore`] with TTL locks.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    positions: Arc<RwLock<HashMap<String, Position>>>,
    locks: Arc<RwLock<HashMap<String, LockEntry>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating new in-memory position store");
        Self::default()
    }

    /// Creates a store pre-populated with `positions`.
    #[must_use]
    pub fn with_positions(positions: impl IntoIterator<Item = Position>) -> Self {
        let positions: HashMap<String, Position> = positions
            .into_iter()
            .map(|p| (p.subscriber_id.clone(), p))
            .collect();
        debug!(
            position_count = positions.len(),
            "Creating in-memory position store with initial positions"
        );
        Self {
            positions: Arc::new(RwLock::new(positions)),
            locks: Arc::default(),
        }
    }

    /// Number of stored positions.
    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    /// Returns `true` if no position is stored.
    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }

    /// Removes every position and lock.
    pub async fn clear(&self) {
        let mut positions = self.positions.write().await;
        let count = positions.len();
        positions.clear();
        self.locks.write().await.clear();
        debug!(cleared_count = count, "Cleared memory store");
    }
}

#[async_trait::async_trait]
impl PositionStore for MemoryStore {
    async fn load(&self, subscriber_id: &str) -> Result<Option<Position>, StoreError> {
        let position = self.positions.read().await.get(subscriber_id).cloned();
        trace!(
            subscriber = subscriber_id,
            found = position.is_some(),
            "Loaded position from memory"
        );
        Ok(position)
    }

    async fn save(&self, position: &Position) -> Result<(), StoreError> {
        trace!(
            subscriber = %position.subscriber_id,
            last_value = %position.last_value,
            "Saving position to memory"
        );
        self.positions
            .write()
            .await
            .insert(position.subscriber_id.clone(), position.clone());
        Ok(())
    }

    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError> {
        let mut positions = self.positions.write().await;
        if positions.remove(subscriber_id).is_some() {
            debug!(
                subscriber = subscriber_id,
                remaining = positions.len(),
                "Deleted position from memory"
            );
        } else {
            warn!(
                subscriber = subscriber_id,
                "Attempted to delete non-existent position"
            );
        }
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, Position>, StoreError> {
        Ok(self.positions.read().await.clone())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut locks = self.locks.write().await;

        if let Some(entry) = locks.get(key) {
            if entry.is_live(now) && entry.owner_id != owner_id {
                debug!(key, owner = %entry.owner_id, "Lock held by another owner");
                return Ok(false);
            }
        }

        locks.insert(
            key.to_string(),
            LockEntry {
                owner_id: owner_id.to_string(),
                expires_at: now + ttl,
            },
        );
        debug!(key, owner = owner_id, "Lock acquired");
        Ok(true)
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut locks = self.locks.write().await;

        match locks.get_mut(key) {
            Some(entry) if entry.owner_id == owner_id && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().await;
        match locks.get(key) {
            Some(entry) if entry.owner_id == owner_id => {
                locks.remove(key);
                debug!(key, owner = owner_id, "Lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .locks
            .read()
            .await
            .get(key)
            .is_some_and(|entry| entry.is_live(now)))
    }
}
