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

//! MongoDB position store.
//!
//! Each subscriber owns one tracking document in a configurable collection
//! (default `tailTracking`), keyed by `persistentId`:
//!
//! ```text
//! {
//!   persistentId: "orders-feed",
//!   trackingField: "seq",          // null in resume-token mode
//!   lastTrackingValue: 42,         // configurable name
//!   resumeToken: { _data: "..." }, // resume-token mode only
//!   updatedAt: ISODate(...)
//! }
//! ```
//!
//! Subscriber locks live in a sibling collection (`tailTrackingLocks`) as
//! `{_id: key, owner, expiresAt}`. Taking a lock is a single upsert that only
//! matches a free, expired or self-owned lock; losing the race surfaces as a
//! duplicate key error on `_id`.

use bson::{doc, Document};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use std::collections::HashMap;
use std::time::Duration;
use tailtrack_core::config::TrackingStoreLocation;
use tailtrack_core::position::fields;
use tailtrack_core::{Position, PositionStore, StoreError};
use tracing::{debug, info, instrument, trace};

const DUPLICATE_KEY: i32 = 11000;

/// Lock document fields.
mod lock_fields {
    pub const ID: &str = "_id";
    pub const OWNER: &str = "owner";
    pub const EXPIRES_AT: &str = "expiresAt";
}

/// [`PositionStore`] persisting tracking documents in MongoDB.
#[derive(Debug, Clone)]
pub struct MongoPositionStore {
    positions: Collection<Document>,
    locks: Collection<Document>,
    value_field: String,
}

impl MongoPositionStore {
    /// Creates a store at `location`.
    ///
    /// `database` is the source database; it holds the tracking collection
    /// unless `location.database` names another one.
    #[must_use]
    pub fn new(database: &Database, location: &TrackingStoreLocation) -> Self {
        let database = match &location.database {
            Some(name) => database.client().database(name),
            None => database.clone(),
        };

        debug!(
            database = %database.name(),
            collection = %location.collection,
            field = %location.field,
            "Creating MongoDB position store"
        );

        Self {
            positions: database.collection(&location.collection),
            locks: database.collection(&format!("{}Locks", location.collection)),
            value_field: location.field.clone(),
        }
    }

    /// Creates the unique index on `persistentId`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the index cannot be created.
    #[instrument(skip(self), fields(collection = %self.positions.name()))]
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let index = IndexModel::builder()
            .keys(doc! { fields::SUBSCRIBER_ID: 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.positions
            .create_index(index)
            .await
            .map_err(connection_error)?;
        info!("Tracking index ensured");
        Ok(())
    }

    /// Tracking collection.
    #[must_use]
    pub fn collection(&self) -> &Collection<Document> {
        &self.positions
    }

    fn subscriber_filter(subscriber_id: &str) -> Document {
        doc! { fields::SUBSCRIBER_ID: subscriber_id }
    }

    fn decode(&self, document: &Document) -> Result<Position, StoreError> {
        Position::from_document(document, &self.value_field).map_err(StoreError::Serialization)
    }
}

fn connection_error(e: MongoError) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn is_duplicate_key(e: &MongoError) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY
        }
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn expires_at(ttl: Duration) -> bson::DateTime {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    bson::DateTime::from_millis(Utc::now().timestamp_millis().saturating_add(ttl_ms))
}

/// Matches a lock that `owner_id` may take: its own or an expired one.
fn acquirable_lock_filter(key: &str, owner_id: &str, now: bson::DateTime) -> Document {
    doc! {
        lock_fields::ID: key,
        "$or": [
            { lock_fields::OWNER: owner_id },
            { lock_fields::EXPIRES_AT: { "$lte": now } },
        ],
    }
}

/// Matches a live lock held by `owner_id`.
fn owned_lock_filter(key: &str, owner_id: &str, now: bson::DateTime) -> Document {
    doc! {
        lock_fields::ID: key,
        lock_fields::OWNER: owner_id,
        lock_fields::EXPIRES_AT: { "$gt": now },
    }
}

#[async_trait::async_trait]
impl PositionStore for MongoPositionStore {
    async fn load(&self, subscriber_id: &str) -> Result<Option<Position>, StoreError> {
        let document = self
            .positions
            .find_one(Self::subscriber_filter(subscriber_id))
            .await
            .map_err(connection_error)?;

        trace!(
            subscriber = subscriber_id,
            found = document.is_some(),
            "Loaded tracking document"
        );
        document.map(|d| self.decode(&d)).transpose()
    }

    async fn save(&self, position: &Position) -> Result<(), StoreError> {
        let replacement = position.to_document(&self.value_field);
        self.positions
            .replace_one(Self::subscriber_filter(&position.subscriber_id), replacement)
            .upsert(true)
            .await
            .map_err(connection_error)?;

        trace!(
            subscriber = %position.subscriber_id,
            last_value = %position.last_value,
            "Saved tracking document"
        );
        Ok(())
    }

    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError> {
        let result = self
            .positions
            .delete_one(Self::subscriber_filter(subscriber_id))
            .await
            .map_err(connection_error)?;
        debug!(
            subscriber = subscriber_id,
            deleted = result.deleted_count,
            "Deleted tracking document"
        );
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, Position>, StoreError> {
        let documents: Vec<Document> = self
            .positions
            .find(doc! {})
            .await
            .map_err(connection_error)?
            .try_collect()
            .await
            .map_err(connection_error)?;

        documents
            .iter()
            .map(|d| self.decode(d).map(|p| (p.subscriber_id.clone(), p)))
            .collect()
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = bson::DateTime::now();
        let update = doc! {
            "$set": {
                lock_fields::OWNER: owner_id,
                lock_fields::EXPIRES_AT: expires_at(ttl),
            }
        };

        match self
            .locks
            .update_one(acquirable_lock_filter(key, owner_id, now), update)
            .upsert(true)
            .await
        {
            Ok(_) => {
                debug!(key, owner = owner_id, "Lock acquired");
                Ok(true)
            }
            Err(e) if is_duplicate_key(&e) => {
                debug!(key, owner = owner_id, "Lock held by another owner");
                Ok(false)
            }
            Err(e) => Err(connection_error(e)),
        }
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = bson::DateTime::now();
        let result = self
            .locks
            .update_one(
                owned_lock_filter(key, owner_id, now),
                doc! { "$set": { lock_fields::EXPIRES_AT: expires_at(ttl) } },
            )
            .await
            .map_err(connection_error)?;
        Ok(result.matched_count == 1)
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool, StoreError> {
        let result = self
            .locks
            .delete_one(doc! { lock_fields::ID: key, lock_fields::OWNER: owner_id })
            .await
            .map_err(connection_error)?;
        Ok(result.deleted_count == 1)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, StoreError> {
        let count = self
            .locks
            .count_documents(doc! {
                lock_fields::ID: key,
                lock_fields::EXPIRES_AT: { "$gt": bson::DateTime::now() },
            })
            .await
            .map_err(connection_error)?;
        Ok(count > 0)
    }
}
