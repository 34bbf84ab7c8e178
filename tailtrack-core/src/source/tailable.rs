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

//! Tailable cursors over MongoDB capped collections.

use super::{CursorHandle, CursorSource, Next, OpenFrom, SourceError};
use crate::config::{ConfigError, ConsumerType, SubscriptionConfig};
use crate::event::{Event, SourcePosition};
use bson::{doc, Bson, Document};
use futures::StreamExt;
use mongodb::options::CursorType;
use mongodb::{Collection, Cursor, Database};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Reads a capped collection in natural order, resuming by the value of a
/// monotonically increasing tracking field.
///
/// The cursor query is `{<trackingField>: {$gt: <last value>}}`. When the
/// server kills the cursor (for example because the collection was empty
/// when it was opened) the handle reports [`Next::Closed`] and the consumer
/// reopens it.
#[derive(Debug, Clone)]
pub struct TailableSource {
    database: Database,
    collection: Collection<Document>,
    tracking_field: String,
    max_await_time: Duration,
    batch_size: Option<u32>,
}

impl TailableSource {
    /// Creates a source over `database.collection`.
    #[must_use]
    pub fn new(database: &Database, collection: &str, tracking_field: impl Into<String>) -> Self {
        Self {
            database: database.clone(),
            collection: database.collection(collection),
            tracking_field: tracking_field.into(),
            max_await_time: Duration::from_millis(500),
            batch_size: None,
        }
    }

    /// Creates the source a tailable subscription is configured for.
    ///
    /// The server-side await is half the poll timeout, so a `getMore` never
    /// outlives the bounded wait in [`CursorHandle::next`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is not a valid tailable
    /// configuration.
    pub fn from_config(database: &Database, config: &SubscriptionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.consumer_type != ConsumerType::Tailable {
            return Err(ConfigError::Invalid(format!(
                "consumerType {} cannot use a tailable cursor",
                config.consumer_type
            )));
        }
        let tracking_field = config
            .tracking_field
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("trackingField".to_string()))?;

        Ok(Self::new(database, &config.collection, tracking_field).max_await_time(config.poll_timeout / 2))
    }

    /// Sets how long the server waits for new documents per `getMore`.
    ///
    /// Keep it below the poll timeout. Default: 500 ms
    #[must_use]
    pub fn max_await_time(mut self, duration: Duration) -> Self {
        self.max_await_time = duration;
        self
    }

    /// Sets the batch size for fetching documents.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    async fn exists(&self) -> Result<bool, SourceError> {
        let names = self
            .database
            .list_collection_names()
            .filter(doc! { "name": self.collection.name() })
            .await?;
        Ok(!names.is_empty())
    }

    /// Tracking value of the most recent document, if any.
    async fn latest_value(&self) -> Result<Option<Bson>, SourceError> {
        let latest = self
            .collection
            .find_one(doc! {})
            .sort(doc! { "$natural": -1 })
            .await?;
        Ok(latest.and_then(|d| crate::event::lookup_path(&d, &self.tracking_field).cloned()))
    }
}

#[async_trait::async_trait]
impl CursorSource for TailableSource {
    fn name(&self) -> &str {
        self.collection.name()
    }

    fn consumer_type(&self) -> ConsumerType {
        ConsumerType::Tailable
    }

    fn tracking_field(&self) -> Option<&str> {
        Some(&self.tracking_field)
    }

    #[instrument(skip(self), fields(collection = %self.collection.name()))]
    async fn open(&self, from: &OpenFrom) -> Result<Box<dyn CursorHandle>, SourceError> {
        if !self.exists().await? {
            return Err(SourceError::NotFound {
                collection: self.collection.name().to_string(),
            });
        }

        let after = match from {
            OpenFrom::Beginning => None,
            OpenFrom::Now => self.latest_value().await?,
            OpenFrom::After(SourcePosition::Value(value)) => Some(value.clone()),
            OpenFrom::After(SourcePosition::ResumeToken(_)) => {
                return Err(SourceError::Configuration(
                    "tailable cursors are positioned by tracking value".into(),
                ))
            }
        };

        let mut filter = Document::new();
        if let Some(value) = &after {
            filter.insert(self.tracking_field.clone(), doc! { "$gt": value.clone() });
        }
        debug!(?filter, "Opening tailable cursor");

        let mut find = self
            .collection
            .find(filter)
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(self.max_await_time)
            .sort(doc! { "$natural": 1 });
        if let Some(size) = self.batch_size {
            find = find.batch_size(size);
        }
        let cursor = find.await?;

        info!(after = ?after, "Tailable cursor opened");

        Ok(Box::new(TailableHandle {
            cursor: Some(cursor),
            tracking_field: self.tracking_field.clone(),
        }))
    }
}

struct TailableHandle {
    cursor: Option<Cursor<Document>>,
    tracking_field: String,
}

#[async_trait::async_trait]
impl CursorHandle for TailableHandle {
    async fn next(&mut self, timeout: Duration) -> Result<Next, SourceError> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(Next::Closed);
        };

        match tokio::time::timeout(timeout, cursor.next()).await {
            Err(_) => Ok(Next::Timeout),
            Ok(None) => {
                debug!("Tailable cursor is dead");
                self.cursor = None;
                Ok(Next::Closed)
            }
            Ok(Some(Err(e))) => Err(SourceError::from_mongo_error(e)),
            Ok(Some(Ok(document))) => Ok(Next::Event(Event::tailed(
                document,
                &self.tracking_field,
            )?)),
        }
    }

    async fn close(&mut self) {
        // Dropping the cursor issues killCursors in the background.
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_await_stays_below_poll_timeout() {
        let client = mongodb::Client::with_uri_str("mongodb://localhost:27017")
            .await
            .unwrap();
        let database = client.database("tailtrack");

        let defaults = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .build()
            .unwrap();
        let source = TailableSource::new(&database, "capped", "increasing");
        assert!(source.max_await_time < defaults.poll_timeout);

        let fast = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .poll_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let source = TailableSource::from_config(&database, &fast).unwrap();
        assert_eq!(source.max_await_time, Duration::from_millis(100));
        assert_eq!(source.tracking_field(), Some("increasing"));
    }
}
