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

//! MongoDB change streams.

use super::{CursorHandle, CursorSource, Next, OpenFrom, SourceError};
use crate::config::{ConfigError, ConsumerType, SubscriptionConfig};
use crate::event::{Event, OperationType, SourcePosition};
use bson::{doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{
    ChangeStreamOptions as MongoChangeStreamOptions, FullDocumentBeforeChangeType,
    FullDocumentType,
};
use mongodb::{Collection, Database};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Server-side options for a change stream.
#[derive(Debug, Clone)]
pub struct ChangeStreamOptions {
    /// Extra aggregation stages applied by the server
    pub pipeline: Vec<Document>,

    /// Look up the current document for update events
    pub full_document_on_update: bool,

    /// Include the pre-image (requires MongoDB 6.0+)
    pub full_document_before_change: bool,

    /// Batch size for fetching events
    pub batch_size: Option<u32>,

    /// How long the server waits for new events per `getMore`
    pub max_await_time: Option<Duration>,
}

impl Default for ChangeStreamOptions {
    fn default() -> Self {
        Self {
            pipeline: Vec::new(),
            full_document_on_update: true,
            full_document_before_change: false,
            batch_size: None,
            max_await_time: None,
        }
    }
}

impl ChangeStreamOptions {
    fn to_mongo_options(&self) -> MongoChangeStreamOptions {
        let mut options = MongoChangeStreamOptions::default();

        if self.full_document_on_update {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        if self.full_document_before_change {
            options.full_document_before_change = Some(FullDocumentBeforeChangeType::WhenAvailable);
        }
        options.batch_size = self.batch_size;
        options.max_await_time = self.max_await_time;

        options
    }
}

/// Watches one collection through a change stream, resuming by token.
///
/// Change streams cannot replay history that predates the stream, so
/// [`OpenFrom::Beginning`] behaves like [`OpenFrom::Now`].
#[derive(Debug, Clone)]
pub struct ChangeStreamSource {
    collection: Collection<Document>,
    options: ChangeStreamOptions,
}

impl ChangeStreamSource {
    /// Creates a source with default options.
    #[must_use]
    pub fn new(collection: Collection<Document>) -> Self {
        Self::with_options(collection, ChangeStreamOptions::default())
    }

    /// Creates a source with explicit options.
    #[must_use]
    pub fn with_options(collection: Collection<Document>, options: ChangeStreamOptions) -> Self {
        Self {
            collection,
            options,
        }
    }

    /// Creates the source a change stream subscription is configured for,
    /// with default options and a server-side await of half the poll timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is not a valid change stream
    /// configuration.
    pub fn from_config(database: &Database, config: &SubscriptionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.consumer_type != ConsumerType::ChangeStreams {
            return Err(ConfigError::Invalid(format!(
                "consumerType {} cannot use a change stream",
                config.consumer_type
            )));
        }
        let options = ChangeStreamOptions {
            max_await_time: Some(config.poll_timeout / 2),
            ..ChangeStreamOptions::default()
        };
        Ok(Self::with_options(database.collection(&config.collection), options))
    }
}

fn to_resume_token(token: &Document) -> Result<ResumeToken, SourceError> {
    // ResumeToken is opaque; round-trip through BSON bytes.
    let bytes = bson::to_vec(token).map_err(|e| SourceError::Conversion(e.to_string()))?;
    bson::from_slice::<ResumeToken>(&bytes).map_err(|e| SourceError::Conversion(e.to_string()))
}

#[async_trait::async_trait]
impl CursorSource for ChangeStreamSource {
    fn name(&self) -> &str {
        self.collection.name()
    }

    fn consumer_type(&self) -> ConsumerType {
        ConsumerType::ChangeStreams
    }

    fn tracking_field(&self) -> Option<&str> {
        None
    }

    #[instrument(skip(self), fields(collection = %self.collection.name()))]
    async fn open(&self, from: &OpenFrom) -> Result<Box<dyn CursorHandle>, SourceError> {
        let mut options = self.options.to_mongo_options();

        match from {
            OpenFrom::Beginning | OpenFrom::Now => {}
            OpenFrom::After(SourcePosition::ResumeToken(token)) => {
                debug!("Resuming from token: {:?}", token);
                options.resume_after = Some(to_resume_token(token)?);
            }
            OpenFrom::After(SourcePosition::Value(_)) => {
                return Err(SourceError::Configuration(
                    "change streams are positioned by resume token".into(),
                ))
            }
        }

        let stream = if self.options.pipeline.is_empty() {
            self.collection.watch().with_options(options).await?
        } else {
            self.collection
                .watch()
                .pipeline(self.options.pipeline.clone())
                .with_options(options)
                .await?
        };

        info!(
            "Change stream opened for {}.{}",
            self.collection.namespace().db,
            self.collection.namespace().coll
        );

        Ok(Box::new(ChangeStreamHandle {
            stream: Some(stream),
        }))
    }
}

struct ChangeStreamHandle {
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
}

#[async_trait::async_trait]
impl CursorHandle for ChangeStreamHandle {
    async fn next(&mut self, timeout: Duration) -> Result<Next, SourceError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(Next::Closed);
            };
            if !stream.is_alive() {
                self.stream = None;
                return Ok(Next::Closed);
            }

            match tokio::time::timeout_at(deadline, stream.next_if_any()).await {
                Err(_) => return Ok(Next::Timeout),
                Ok(Err(e)) => return Err(SourceError::from_mongo_error(e)),
                Ok(Ok(Some(event))) => {
                    let converted = convert_event(event);
                    if converted.is_err() {
                        self.stream = None;
                    }
                    return converted.map(Next::Event);
                }
                Ok(Ok(None)) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(Next::Timeout);
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

fn convert_operation(op: &mongodb::change_stream::event::OperationType) -> OperationType {
    use mongodb::change_stream::event::OperationType as MongoOpType;

    match op {
        MongoOpType::Insert => OperationType::Insert,
        MongoOpType::Update => OperationType::Update,
        MongoOpType::Delete => OperationType::Delete,
        MongoOpType::Replace => OperationType::Replace,
        MongoOpType::Invalidate => OperationType::Invalidate,
        MongoOpType::Drop => OperationType::Drop,
        MongoOpType::DropDatabase => OperationType::DropDatabase,
        MongoOpType::Rename => OperationType::Rename,
        other => {
            let name = format!("{other:?}");
            warn!(operation = %name, "Unknown change stream operation type");
            OperationType::Unknown(name)
        }
    }
}

/// Converts a driver event into an [`Event`].
///
/// Invalidation ends the stream and is reported as an error.
fn convert_event(event: ChangeStreamEvent<Document>) -> Result<Event, SourceError> {
    let operation = convert_operation(&event.operation_type);
    if operation == OperationType::Invalidate {
        return Err(SourceError::Invalidated {
            reason: "change stream invalidated".to_string(),
        });
    }

    let resume_token = bson::to_document(&event.id).map_err(|e| {
        SourceError::Conversion(format!(
            "Failed to serialize resume token to BSON document: {e}"
        ))
    })?;

    let id = event
        .document_key
        .as_ref()
        .and_then(|key| key.get("_id"))
        .cloned();

    let payload = match (&operation, event.full_document) {
        (OperationType::Delete, _) => event.document_key.unwrap_or_default(),
        (_, Some(full)) => full,
        (OperationType::Update, None) => update_payload(id.as_ref(), event.update_description),
        (_, None) => event.document_key.unwrap_or_default(),
    };

    Ok(Event::change(operation, payload, id, resume_token))
}

/// Payload for an update whose current document could not be looked up.
fn update_payload(
    id: Option<&Bson>,
    description: Option<mongodb::change_stream::event::UpdateDescription>,
) -> Document {
    let mut payload = Document::new();
    if let Some(id) = id {
        payload.insert("_id", id.clone());
    }
    if let Some(description) = description {
        let removed: Vec<Bson> = description
            .removed_fields
            .into_iter()
            .map(Bson::String)
            .collect();
        payload.insert(
            "updateDescription",
            doc! {
                "updatedFields": description.updated_fields,
                "removedFields": removed,
            },
        );
    }
    payload
}
