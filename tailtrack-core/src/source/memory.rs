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

//! In-process ordered log.
//!
//! [`MemoryLog`] behaves like a single MongoDB collection that can be read
//! either through a tailable cursor (inserts only, positioned by a tracking
//! field) or through a change stream (all operations, positioned by resume
//! token). It supports failure injection so reconnect paths can be
//! exercised without a server.
//!
//! ```rust
//! use bson::doc;
//! use std::time::Duration;
//! use tailtrack_core::source::{CursorSource, MemoryLog, Next, OpenFrom};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let log = MemoryLog::new("capped");
//! log.insert(doc! { "increasing": 1 }).await;
//!
//! let source = log.tailable("increasing");
//! let mut cursor = source.open(&OpenFrom::Beginning).await?;
//! match cursor.next(Duration::from_millis(10)).await? {
//!     Next::Event(event) => assert_eq!(event.payload.get_i32("increasing")?, 1),
//!     other => panic!("unexpected {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

use super::{CursorHandle, CursorSource, Next, OpenFrom, SourceError};
use crate::config::ConsumerType;
use crate::event::{lookup_path, Event, OperationType, SourcePosition};
use crate::position::compare_values;
use bson::{doc, oid::ObjectId, Bson, Document};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Record {
    seq: u64,
    generation: u64,
    operation: OperationType,
    document: Document,
    id: Option<Bson>,
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<Record>,
    exists: bool,
    next_seq: u64,
    generation: u64,
    failing_reads: u32,
    failing_opens: u32,
}

impl LogState {
    fn append(&mut self, operation: OperationType, document: Document, id: Option<Bson>) {
        self.next_seq += 1;
        self.records.push(Record {
            seq: self.next_seq,
            generation: self.generation,
            operation,
            document,
            id,
        });
    }

    fn last_seq(&self) -> u64 {
        self.records.last().map_or(0, |r| r.seq)
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    state: Mutex<LogState>,
    notify: Notify,
}

/// An in-memory collection with an append-only history.
///
/// Clones share the same log.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    /// Creates an existing, empty collection.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state(name.into(), true)
    }

    /// Creates a handle to a collection that does not exist yet.
    ///
    /// Tailable opens fail with [`SourceError::NotFound`] until
    /// [`MemoryLog::create`] or the first insert.
    #[must_use]
    pub fn missing(name: impl Into<String>) -> Self {
        Self::with_state(name.into(), false)
    }

    fn with_state(name: String, exists: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(LogState {
                    exists,
                    ..LogState::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Creates the collection if it does not exist.
    pub async fn create(&self) {
        self.shared.state.lock().await.exists = true;
        self.shared.notify.notify_waiters();
    }

    /// Appends a document, assigning an `ObjectId` `_id` when missing.
    ///
    /// Returns the document id.
    pub async fn insert(&self, mut document: Document) -> Bson {
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                document.insert("_id", id.clone());
                id
            }
        };

        {
            let mut state = self.shared.state.lock().await;
            state.exists = true;
            state.append(OperationType::Insert, document, Some(id.clone()));
        }
        self.shared.notify.notify_waiters();
        id
    }

    /// Appends several documents in order.
    pub async fn insert_many(&self, documents: impl IntoIterator<Item = Document>) -> Vec<Bson> {
        let mut ids = Vec::new();
        for document in documents {
            ids.push(self.insert(document).await);
        }
        ids
    }

    /// Records an update; `document` is the full post-image.
    pub async fn update(&self, id: Bson, mut document: Document) {
        document.insert("_id", id.clone());
        self.append(OperationType::Update, document, Some(id)).await;
    }

    /// Records a full document replacement.
    pub async fn replace(&self, id: Bson, mut document: Document) {
        document.insert("_id", id.clone());
        self.append(OperationType::Replace, document, Some(id)).await;
    }

    /// Records a delete.
    pub async fn delete(&self, id: Bson) {
        self.append(OperationType::Delete, doc! { "_id": id.clone() }, Some(id))
            .await;
    }

    /// Drops the collection.
    ///
    /// Open tailable cursors end with [`Next::Closed`]; open change streams
    /// observe a `drop` followed by an invalidation.
    pub async fn drop_collection(&self) {
        {
            let mut state = self.shared.state.lock().await;
            state.append(OperationType::Drop, Document::new(), None);
            state.append(OperationType::Invalidate, Document::new(), None);
            state.exists = false;
            state.generation += 1;
        }
        debug!(collection = %self.shared.name, "Dropped in-memory collection");
        self.shared.notify.notify_waiters();
    }

    /// Makes the next `count` reads (on any cursor) fail with a retryable
    /// connection error.
    pub async fn fail_next_reads(&self, count: u32) {
        self.shared.state.lock().await.failing_reads = count;
        self.shared.notify.notify_waiters();
    }

    /// Makes the next `count` opens fail with a retryable connection error.
    pub async fn fail_next_opens(&self, count: u32) {
        self.shared.state.lock().await.failing_opens = count;
    }

    /// Number of records in the history, including non-insert operations.
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.records.len()
    }

    /// Returns true if nothing was ever written.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Source reading inserts through a tailable cursor keyed on `tracking_field`.
    #[must_use]
    pub fn tailable(&self, tracking_field: impl Into<String>) -> MemorySource {
        MemorySource {
            log: self.clone(),
            mode: Mode::Tailable {
                tracking_field: tracking_field.into(),
            },
        }
    }

    /// Source reading all operations through a change stream.
    #[must_use]
    pub fn change_stream(&self) -> MemorySource {
        MemorySource {
            log: self.clone(),
            mode: Mode::ChangeStream,
        }
    }

    async fn append(&self, operation: OperationType, document: Document, id: Option<Bson>) {
        self.shared
            .state
            .lock()
            .await
            .append(operation, document, id);
        self.shared.notify.notify_waiters();
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Tailable { tracking_field: String },
    ChangeStream,
}

/// [`CursorSource`] over a [`MemoryLog`].
#[derive(Debug, Clone)]
pub struct MemorySource {
    log: MemoryLog,
    mode: Mode,
}

#[async_trait::async_trait]
impl CursorSource for MemorySource {
    fn name(&self) -> &str {
        self.log.name()
    }

    fn consumer_type(&self) -> ConsumerType {
        match self.mode {
            Mode::Tailable { .. } => ConsumerType::Tailable,
            Mode::ChangeStream => ConsumerType::ChangeStreams,
        }
    }

    fn tracking_field(&self) -> Option<&str> {
        match &self.mode {
            Mode::Tailable { tracking_field } => Some(tracking_field),
            Mode::ChangeStream => None,
        }
    }

    async fn open(&self, from: &OpenFrom) -> Result<Box<dyn CursorHandle>, SourceError> {
        let mut state = self.log.shared.state.lock().await;

        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(SourceError::transient("injected open failure"));
        }

        let cursor = match &self.mode {
            Mode::Tailable { tracking_field } => {
                if !state.exists {
                    return Err(SourceError::NotFound {
                        collection: self.log.name().to_string(),
                    });
                }
                let (after_seq, after_value) = match from {
                    OpenFrom::Beginning => (0, None),
                    OpenFrom::Now => (state.last_seq(), None),
                    OpenFrom::After(SourcePosition::Value(value)) => (0, Some(value.clone())),
                    OpenFrom::After(SourcePosition::ResumeToken(_)) => {
                        return Err(SourceError::Configuration(
                            "tailable cursors are positioned by tracking value".into(),
                        ))
                    }
                };
                MemoryCursor {
                    shared: Arc::clone(&self.log.shared),
                    tracking_field: Some(tracking_field.clone()),
                    after_seq,
                    after_value,
                    generation: state.generation,
                    closed: false,
                }
            }
            Mode::ChangeStream => {
                let after_seq = match from {
                    OpenFrom::Beginning | OpenFrom::Now => state.last_seq(),
                    OpenFrom::After(SourcePosition::ResumeToken(token)) => {
                        let seq = parse_token(token)
                            .filter(|seq| state.records.iter().any(|r| r.seq == *seq))
                            .ok_or(SourceError::InvalidResumeToken { code: 286 })?;
                        seq
                    }
                    OpenFrom::After(SourcePosition::Value(_)) => {
                        return Err(SourceError::Configuration(
                            "change streams are positioned by resume token".into(),
                        ))
                    }
                };
                MemoryCursor {
                    shared: Arc::clone(&self.log.shared),
                    tracking_field: None,
                    after_seq,
                    after_value: None,
                    generation: state.generation,
                    closed: false,
                }
            }
        };

        trace!(
            collection = %self.log.name(),
            after_seq = cursor.after_seq,
            "Opened in-memory cursor"
        );
        Ok(Box::new(cursor))
    }
}

fn resume_token(seq: u64) -> Document {
    doc! { "_data": format!("{seq:016x}") }
}

fn parse_token(token: &Document) -> Option<u64> {
    u64::from_str_radix(token.get_str("_data").ok()?, 16).ok()
}

struct MemoryCursor {
    shared: Arc<Shared>,
    /// `Some` for tailable cursors.
    tracking_field: Option<String>,
    after_seq: u64,
    after_value: Option<Bson>,
    generation: u64,
    closed: bool,
}

enum Poll {
    Ready(Result<Next, SourceError>),
    Pending,
}

impl MemoryCursor {
    fn poll(&mut self, state: &mut LogState) -> Poll {
        if self.closed {
            return Poll::Ready(Ok(Next::Closed));
        }
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Poll::Ready(Err(SourceError::transient("injected read failure")));
        }

        match self.tracking_field.clone() {
            Some(field) => self.poll_tailable(state, &field),
            None => self.poll_change_stream(state),
        }
    }

    fn poll_tailable(&mut self, state: &LogState, field: &str) -> Poll {
        let start = self.after_seq;
        for record in state.records.iter().filter(|r| r.seq > start) {
            self.after_seq = record.seq;
            if record.generation != self.generation || record.operation != OperationType::Insert
            {
                continue;
            }
            if let Some(after) = &self.after_value {
                let newer = lookup_path(&record.document, field)
                    .and_then(|v| compare_values(v, after))
                    == Some(Ordering::Greater);
                if !newer {
                    continue;
                }
            }
            return Poll::Ready(
                Event::tailed(record.document.clone(), field)
                    .map(Next::Event)
                    .map_err(SourceError::from),
            );
        }

        if state.generation != self.generation {
            self.closed = true;
            return Poll::Ready(Ok(Next::Closed));
        }
        Poll::Pending
    }

    fn poll_change_stream(&mut self, state: &LogState) -> Poll {
        let Some(record) = state.records.iter().find(|r| r.seq > self.after_seq) else {
            return Poll::Pending;
        };

        if record.operation == OperationType::Invalidate {
            self.closed = true;
            return Poll::Ready(Err(SourceError::Invalidated {
                reason: "collection dropped".to_string(),
            }));
        }

        self.after_seq = record.seq;
        Poll::Ready(Ok(Next::Event(Event::change(
            record.operation.clone(),
            record.document.clone(),
            record.id.clone(),
            resume_token(record.seq),
        ))))
    }
}

#[async_trait::async_trait]
impl CursorHandle for MemoryCursor {
    async fn next(&mut self, timeout: Duration) -> Result<Next, SourceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);

        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock().await;
                if let Poll::Ready(result) = self.poll(&mut state) {
                    return result;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Next::Timeout);
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
