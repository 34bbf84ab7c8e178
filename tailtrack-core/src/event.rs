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

//! Events produced by cursor sources.
//!
//! An [`Event`] is one unit read from a tailable cursor or a change stream.
//! It carries the document payload, the position it was read at, and for
//! change streams the operation that produced it.
//!
//! # Example
//!
//! ```rust
//! use bson::{doc, Bson};
//! use tailtrack_core::event::{Event, OperationType, SourcePosition};
//!
//! // Tailed document, tracked by its `increasing` field
//! let event = Event::tailed(doc! { "_id": 1, "increasing": 7 }, "increasing").unwrap();
//! assert_eq!(event.source_position, SourcePosition::Value(Bson::Int32(7)));
//! assert!(event.operation.is_none());
//!
//! // Change stream delete: only the key survives
//! let event = Event::change(
//!     OperationType::Delete,
//!     doc! { "_id": 1 },
//!     Some(Bson::Int32(1)),
//!     doc! { "_data": "0000000000000001" },
//! );
//! assert!(event.is_delete());
//! assert_eq!(event.payload, doc! { "_id": 1 });
//! ```

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Change stream operation types.
///
/// `Unknown` keeps forward compatibility with operation types introduced by
/// newer server versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted
    Insert,

    /// A document was updated in place
    Update,

    /// A document was deleted
    Delete,

    /// A document was replaced entirely
    Replace,

    /// The stream was invalidated (collection dropped or renamed)
    Invalidate,

    /// A collection was dropped
    Drop,

    /// A database was dropped
    DropDatabase,

    /// A collection was renamed
    Rename,

    /// An operation type this library does not know about
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns the server-side name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Invalidate => "invalidate",
            Self::Drop => "drop",
            Self::DropDatabase => "dropDatabase",
            Self::Rename => "rename",
            Self::Unknown(name) => name,
        }
    }

    /// Returns true if this operation modifies data (insert, update, replace).
    #[inline]
    #[must_use]
    pub fn is_data_modification(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Replace)
    }

    /// Returns true if this operation removes data (delete, drop, drop database).
    #[inline]
    #[must_use]
    pub fn is_data_removal(&self) -> bool {
        matches!(self, Self::Delete | Self::Drop | Self::DropDatabase)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event sits in its source.
///
/// Tailable cursors are ordered by the value of a monotonic field; change
/// streams are ordered by opaque resume tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePosition {
    /// Value of the tracking field
    Value(Bson),

    /// Change stream resume token
    ResumeToken(Document),
}

impl SourcePosition {
    /// Returns the tracking field value, if this is a field position.
    #[must_use]
    pub fn as_value(&self) -> Option<&Bson> {
        match self {
            Self::Value(v) => Some(v),
            Self::ResumeToken(_) => None,
        }
    }

    /// Returns the resume token, if this is a change stream position.
    #[must_use]
    pub fn as_resume_token(&self) -> Option<&Document> {
        match self {
            Self::Value(_) => None,
            Self::ResumeToken(t) => Some(t),
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::ResumeToken(t) => write!(f, "token {t}"),
        }
    }
}

/// Error returned when a tailed document cannot become an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The document does not carry the tracking field
    #[error("document is missing tracking field '{0}'")]
    MissingTrackingField(String),
}

/// One unit read from a cursor source.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Document payload.
    ///
    /// For change stream deletes this is only the document key (`{_id: ...}`),
    /// the deleted document itself is not available from the server.
    pub payload: Document,

    /// Position of this event in its source
    pub source_position: SourcePosition,

    /// Change stream operation; `None` for tailed documents
    pub operation: Option<OperationType>,

    /// Identity of the affected document, when known
    pub id: Option<Bson>,
}

impl Event {
    /// Builds an event from a document read through a tailable cursor.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MissingTrackingField`] if `tracking_field` is absent.
    pub fn tailed(payload: Document, tracking_field: &str) -> Result<Self, EventError> {
        let value = lookup_path(&payload, tracking_field)
            .cloned()
            .ok_or_else(|| EventError::MissingTrackingField(tracking_field.to_string()))?;
        let id = payload.get("_id").cloned();

        Ok(Self {
            payload,
            source_position: SourcePosition::Value(value),
            operation: None,
            id,
        })
    }

    /// Builds a change stream event.
    #[must_use]
    pub fn change(
        operation: OperationType,
        payload: Document,
        id: Option<Bson>,
        resume_token: Document,
    ) -> Self {
        Self {
            payload,
            source_position: SourcePosition::ResumeToken(resume_token),
            operation: Some(operation),
            id,
        }
    }

    /// Returns true if this is a change stream insert.
    #[inline]
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.operation == Some(OperationType::Insert)
    }

    /// Returns true if this is a change stream update.
    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.operation == Some(OperationType::Update)
    }

    /// Returns true if this is a change stream delete.
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.operation == Some(OperationType::Delete)
    }

    /// Returns the operation label used in logs and metrics.
    #[must_use]
    pub fn operation_label(&self) -> &str {
        self.operation.as_ref().map_or("tail", OperationType::as_str)
    }

    /// The document an event filter is evaluated against.
    ///
    /// Tailed events expose their payload directly. Change events are shaped
    /// like a server change document so `$match` style expressions such as
    /// `{"fullDocument.status": "open"}` or `{"operationType": "delete"}` work.
    #[must_use]
    pub fn filter_view(&self) -> Document {
        match &self.operation {
            None => self.payload.clone(),
            Some(op) => {
                let mut view = doc! { "operationType": op.as_str() };
                if let Some(id) = &self.id {
                    view.insert("documentKey", doc! { "_id": id.clone() });
                }
                if !matches!(op, OperationType::Delete) {
                    view.insert("fullDocument", self.payload.clone());
                }
                view
            }
        }
    }
}

/// Resolves a dotted path (`a.b.c`) through nested documents.
pub(crate) fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tailed_event_extracts_tracking_value() {
        let event = Event::tailed(doc! { "_id": 5, "increasing": 42_i64 }, "increasing").unwrap();
        assert_eq!(event.source_position, SourcePosition::Value(Bson::Int64(42)));
        assert_eq!(event.id, Some(Bson::Int32(5)));
        assert_eq!(event.operation_label(), "tail");
    }

    #[test]
    fn test_tailed_event_nested_tracking_field() {
        let event = Event::tailed(doc! { "meta": { "seq": 3 } }, "meta.seq").unwrap();
        assert_eq!(event.source_position.as_value(), Some(&Bson::Int32(3)));
    }

    #[test]
    fn test_tailed_event_missing_field() {
        let err = Event::tailed(doc! { "_id": 1 }, "increasing").unwrap_err();
        assert_eq!(err, EventError::MissingTrackingField("increasing".to_string()));
    }

    #[test]
    fn test_filter_view_for_delete_has_no_full_document() {
        let event = Event::change(
            OperationType::Delete,
            doc! { "_id": 9 },
            Some(Bson::Int32(9)),
            doc! { "_data": "01" },
        );
        let view = event.filter_view();
        assert_eq!(view.get_str("operationType").unwrap(), "delete");
        assert!(view.get("fullDocument").is_none());
        assert_eq!(view.get_document("documentKey").unwrap(), &doc! { "_id": 9 });
    }

    #[test]
    fn test_filter_view_for_insert() {
        let event = Event::change(
            OperationType::Insert,
            doc! { "_id": 1, "string": "value2" },
            Some(Bson::Int32(1)),
            doc! { "_data": "01" },
        );
        let view = event.filter_view();
        assert_eq!(
            view.get_document("fullDocument").unwrap().get_str("string").unwrap(),
            "value2"
        );
    }

    #[test]
    fn test_operation_type_names() {
        assert_eq!(OperationType::DropDatabase.as_str(), "dropDatabase");
        assert_eq!(OperationType::Unknown("shardCollection".into()).to_string(), "shardCollection");
        assert!(OperationType::Replace.is_data_modification());
        assert!(OperationType::Drop.is_data_removal());
    }

    #[test]
    fn test_lookup_path_through_array() {
        let doc = doc! { "tags": [ { "name": "a" }, { "name": "b" } ] };
        assert_eq!(lookup_path(&doc, "tags.1.name"), Some(&Bson::String("b".into())));
        assert_eq!(lookup_path(&doc, "tags.5.name"), None);
    }
}
