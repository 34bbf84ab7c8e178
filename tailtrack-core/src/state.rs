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

//! Position store abstraction.
//!
//! A [`PositionStore`] persists one [`Position`] per subscriber id. The
//! consumer loads it at start, saves it after every delivered event, and
//! flushes it once more at stop. Implementations live in the
//! `tailtrack-stores` crate (in-memory, file, MongoDB, Redis).
//!
//! Stores shared by several processes can also offer a TTL-based lock so
//! that at most one consumer tails a given subscriber id at a time. Stores
//! that cannot lock keep the default implementations, which always grant
//! the lock.

use crate::position::Position;
use std::collections::HashMap;
use std::time::Duration;

/// Durable storage for subscriber positions.
#[async_trait::async_trait]
pub trait PositionStore: Send + Sync {
    /// Loads the position stored for a subscriber.
    ///
    /// Returns `None` if nothing was ever saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or the record is
    /// corrupt.
    async fn load(&self, subscriber_id: &str) -> Result<Option<Position>, StoreError>;

    /// Upserts the position for `position.subscriber_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the position cannot be written.
    async fn save(&self, position: &Position) -> Result<(), StoreError>;

    /// Deletes the position stored for a subscriber. Deleting a missing
    /// record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError>;

    /// Lists all stored positions keyed by subscriber id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn list(&self) -> Result<HashMap<String, Position>, StoreError>;

    /// Releases any resources held by the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    // ==========================================================================
    // Distributed Locking Methods
    // ==========================================================================

    /// Tries to acquire an exclusive lock on `key` for `owner_id`.
    ///
    /// The lock expires after `ttl` unless refreshed.
    ///
    /// * `Ok(true)` - lock acquired (or already held by this owner)
    /// * `Ok(false)` - lock held by another owner
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn try_acquire_lock(
        &self,
        _key: &str,
        _owner_id: &str,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    /// Extends a lock held by `owner_id`.
    ///
    /// Returns `Ok(false)` if the lock expired or belongs to someone else.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn refresh_lock(
        &self,
        _key: &str,
        _owner_id: &str,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    /// Releases a lock held by `owner_id`.
    ///
    /// Returns `Ok(false)` if the lock was not held by this owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn release_lock(&self, _key: &str, _owner_id: &str) -> Result<bool, StoreError> {
        Ok(true)
    }

    /// Reports whether anyone currently holds `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn is_locked(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
}

/// Lock key used for a subscriber id.
#[must_use]
pub fn lock_key(subscriber_id: &str) -> String {
    format!("tailtrack:lock:{subscriber_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other errors
    #[error("Position store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Short label used in metrics and logs.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Connection(_) => "connection",
            Self::NotFound(_) => "not_found",
            Self::Other(_) => "other",
        }
    }
}
