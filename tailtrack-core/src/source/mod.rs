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

//! Cursor sources.
//!
//! A [`CursorSource`] opens ordered reads over one collection. Two MongoDB
//! variants exist:
//!
//! - [`TailableSource`]: a tailable-await cursor over a capped collection,
//!   positioned by the value of a monotonically increasing tracking field.
//! - [`ChangeStreamSource`]: a change stream, positioned by resume token.
//!
//! [`MemoryLog`] provides both behaviours in process, for tests and demos.
//!
//! Every [`CursorHandle::next`] call is bounded by a poll timeout so the
//! consumer can observe shutdown requests between reads.

mod change_stream;
mod memory;
mod tailable;

pub use change_stream::{ChangeStreamOptions, ChangeStreamSource};
pub use memory::{MemoryLog, MemorySource};
pub use tailable::TailableSource;

use crate::config::{ConfigError, ConsumerType, SubscriptionConfig};
use crate::event::{Event, EventError, SourcePosition};
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind};
use mongodb::Database;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Where a newly opened cursor starts reading.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenFrom {
    /// From the oldest available record.
    Beginning,
    /// From records appended after the open.
    Now,
    /// Strictly after a previously seen position.
    After(SourcePosition),
}

/// Builds the MongoDB source selected by `consumerType`.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the configuration is invalid.
pub fn source_for(
    database: &Database,
    config: &SubscriptionConfig,
) -> Result<Arc<dyn CursorSource>, ConfigError> {
    Ok(match config.consumer_type {
        ConsumerType::Tailable => Arc::new(TailableSource::from_config(database, config)?),
        ConsumerType::ChangeStreams => Arc::new(ChangeStreamSource::from_config(database, config)?),
    })
}

/// Outcome of a single [`CursorHandle::next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    /// The next event in source order.
    Event(Event),
    /// No event arrived within the poll timeout.
    Timeout,
    /// The cursor ended; it must be reopened to continue.
    Closed,
}

/// Factory for cursors over one collection.
#[async_trait::async_trait]
pub trait CursorSource: Send + Sync {
    /// Human-readable name, usually the collection name.
    fn name(&self) -> &str;

    /// Kind of cursor this source opens.
    fn consumer_type(&self) -> ConsumerType;

    /// Field whose value positions the cursor; `None` for change streams.
    fn tracking_field(&self) -> Option<&str>;

    /// Opens a cursor.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] if the collection does not exist
    /// yet, or another [`SourceError`] if the open fails.
    async fn open(&self, from: &OpenFrom) -> Result<Box<dyn CursorHandle>, SourceError>;
}

/// An open cursor.
#[async_trait::async_trait]
pub trait CursorHandle: Send {
    /// Waits up to `timeout` for the next event.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor fails; the handle should then be
    /// closed and a new one opened.
    async fn next(&mut self, timeout: Duration) -> Result<Next, SourceError>;

    /// Releases the cursor. Calling it more than once is harmless.
    async fn close(&mut self);
}

/// Errors raised by cursor sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Collection does not exist (yet)
    #[error("Collection not found: {collection}")]
    NotFound { collection: String },

    /// MongoDB connection error (may be retryable)
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// MongoDB error code
        code: Option<i32>,
        /// MongoDB error labels (e.g., "RetryableWriteError")
        labels: Vec<String>,
    },

    /// Stream was invalidated (collection dropped/renamed)
    #[error("Stream invalidated: {reason}")]
    Invalidated { reason: String },

    /// Resume token is invalid or oplog truncated (error code 286)
    #[error("Invalid resume token (code {code}): oplog may be truncated")]
    InvalidResumeToken { code: i32 },

    /// Record could not be turned into an event
    #[error("Event conversion failed: {0}")]
    Conversion(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for SourceError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

impl From<EventError> for SourceError {
    fn from(err: EventError) -> Self {
        Self::Conversion(err.to_string())
    }
}

impl SourceError {
    /// Creates a `SourceError` from a MongoDB error, classifying it by code
    /// and labels.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        // ChangeStreamFatalError
        if code == Some(286) {
            return Self::InvalidResumeToken { code: 286 };
        }

        let network = matches!(
            err.kind.as_ref(),
            MongoErrorKind::Io(_) | MongoErrorKind::ConnectionPoolCleared { .. }
        );
        let mut labels: Vec<String> = err.labels().iter().cloned().collect();
        if network && !labels.iter().any(|l| l == "NetworkError") {
            labels.push("NetworkError".to_string());
        }

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }

    /// Creates a retryable connection error without a MongoDB cause.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
            code: None,
            labels: vec!["NetworkError".to_string()],
        }
    }

    /// Returns true if reopening the cursor may succeed.
    ///
    /// - Error labels: RetryableWriteError, TransientTransactionError, NetworkError
    /// - Transient error codes: 6, 7, 43, 89, 91, 10107, 11600, 11602, 13435, 13436
    /// - A missing collection may be created later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Connection { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "RetryableWriteError"
                        || l == "TransientTransactionError"
                        || l == "NetworkError"
                }) {
                    return true;
                }

                matches!(
                    code,
                    Some(
                        6 |    // HostUnreachable
                        7 |    // HostNotFound
                        89 |   // NetworkTimeout
                        91 |   // ShutdownInProgress
                        10107 | // NotPrimary
                        11600 | // InterruptedAtShutdown
                        11602 | // InterruptedDueToReplStateChange
                        13435 | // NotPrimaryNoSecondaryOk
                        13436 | // NotPrimaryOrSecondary
                        43 // CursorNotFound
                    )
                )
            }
            Self::Invalidated { .. }
            | Self::InvalidResumeToken { .. }
            | Self::Conversion(_)
            | Self::Configuration(_) => false,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Connection { .. } => "connection",
            Self::Invalidated { .. } => "invalidated",
            Self::InvalidResumeToken { .. } => "invalid_token",
            Self::Conversion(_) => "conversion",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(code: Option<i32>, labels: &[&str]) -> SourceError {
        SourceError::Connection {
            message: "boom".into(),
            source: None,
            code,
            labels: labels.iter().map(|l| (*l).to_string()).collect(),
        }
    }

    #[test]
    fn test_retryable_by_label_and_code() {
        assert!(connection(None, &["NetworkError"]).is_retryable());
        assert!(connection(Some(43), &[]).is_retryable());
        assert!(connection(Some(11602), &[]).is_retryable());
        assert!(!connection(Some(13), &[]).is_retryable());
        assert!(!connection(None, &[]).is_retryable());
    }

    #[test]
    fn test_not_found_is_retryable() {
        let err = SourceError::NotFound {
            collection: "capped".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(!SourceError::InvalidResumeToken { code: 286 }.is_retryable());
        assert!(!SourceError::Invalidated {
            reason: "dropped".into()
        }
        .is_retryable());
        assert!(!SourceError::Conversion("x".into()).is_retryable());
        assert!(SourceError::transient("reset").is_retryable());
    }

    #[tokio::test]
    async fn test_source_for_selects_by_consumer_type() {
        // The driver connects lazily; no server is needed to build sources.
        let client = mongodb::Client::with_uri_str("mongodb://localhost:27017")
            .await
            .unwrap();
        let database = client.database("tailtrack");

        let tailable = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .build()
            .unwrap();
        let source = source_for(&database, &tailable).unwrap();
        assert_eq!(source.consumer_type(), ConsumerType::Tailable);
        assert_eq!(source.tracking_field(), Some("increasing"));
        assert_eq!(source.name(), "capped");
        assert!(tailable.check_source(source.as_ref()).is_ok());
        assert!(ChangeStreamSource::from_config(&database, &tailable).is_err());

        let stream = SubscriptionConfig::builder()
            .collection("orders")
            .consumer_type(ConsumerType::ChangeStreams)
            .build()
            .unwrap();
        let source = source_for(&database, &stream).unwrap();
        assert_eq!(source.consumer_type(), ConsumerType::ChangeStreams);
        assert_eq!(source.tracking_field(), None);
        assert!(stream.check_source(source.as_ref()).is_ok());
        assert!(TailableSource::from_config(&database, &stream).is_err());
    }
}
