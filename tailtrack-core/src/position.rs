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

//! Subscriber positions.
//!
//! A [`Position`] records how far a subscriber has read. In field-comparison
//! mode it holds the highest tracking field value observed; in resume-token
//! mode it holds the token of the last observed change event.
//!
//! Positions only move forward. [`Position::advance`] refuses values that
//! compare lower than the one already held, so a store never sees a
//! position regress for the same subscriber.

use crate::event::SourcePosition;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use tracing::warn;

/// Field names used when a position is stored as a document.
pub mod fields {
    /// Subscriber identity
    pub const SUBSCRIBER_ID: &str = "persistentId";
    /// Name of the tracking field, absent in resume-token mode
    pub const TRACKING_FIELD: &str = "trackingField";
    /// Default name of the last tracked value
    pub const LAST_VALUE: &str = "lastTrackingValue";
    /// Last resume token
    pub const RESUME_TOKEN: &str = "resumeToken";
    /// Last update timestamp
    pub const UPDATED_AT: &str = "updatedAt";
}

/// How far a subscriber has read.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Stable identity of the consumer (`persistentId`)
    pub subscriber_id: String,

    /// Monotonic field used for resumption; `None` in resume-token mode
    pub tracking_field: Option<String>,

    /// Last observed position
    pub last_value: SourcePosition,

    /// When this position last moved
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Creates a new position.
    #[must_use]
    pub fn new(
        subscriber_id: impl Into<String>,
        tracking_field: Option<String>,
        last_value: SourcePosition,
    ) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            tracking_field,
            last_value,
            updated_at: Utc::now(),
        }
    }

    /// Moves the position to `value` if it is not behind the current one.
    ///
    /// Resume tokens are opaque and always replace the held token. Field values
    /// replace the held value only when they compare greater. Values of
    /// incomparable BSON types are accepted with a warning, since the source
    /// defines the order.
    ///
    /// Returns `true` if the position changed.
    pub fn advance(&mut self, value: &SourcePosition) -> bool {
        let changed = match (&self.last_value, value) {
            (SourcePosition::Value(current), SourcePosition::Value(next)) => {
                match compare_values(next, current) {
                    Some(Ordering::Greater) => true,
                    Some(_) => false,
                    None => {
                        warn!(
                            subscriber_id = %self.subscriber_id,
                            current = %current,
                            next = %next,
                            "Tracking values are not comparable, accepting source order"
                        );
                        true
                    }
                }
            }
            (_, next) => &self.last_value != next,
        };

        if changed {
            self.last_value = value.clone();
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Serializes the position as a tracking document.
    ///
    /// The last value is written under `value_field`, which lets stores honour a
    /// configured field name.
    #[must_use]
    pub fn to_document(&self, value_field: &str) -> Document {
        let mut document = doc! { fields::SUBSCRIBER_ID: &self.subscriber_id };
        match &self.tracking_field {
            Some(field) => document.insert(fields::TRACKING_FIELD, field.as_str()),
            None => document.insert(fields::TRACKING_FIELD, Bson::Null),
        };
        match &self.last_value {
            SourcePosition::Value(v) => document.insert(value_field, v.clone()),
            SourcePosition::ResumeToken(t) => document.insert(fields::RESUME_TOKEN, t.clone()),
        };
        document.insert(
            fields::UPDATED_AT,
            bson::DateTime::from_millis(self.updated_at.timestamp_millis()),
        );
        document
    }

    /// Reads a position back from a tracking document.
    ///
    /// # Errors
    ///
    /// Returns a description of the first missing or mistyped field.
    pub fn from_document(document: &Document, value_field: &str) -> Result<Self, String> {
        let subscriber_id = document
            .get_str(fields::SUBSCRIBER_ID)
            .map_err(|e| format!("invalid '{}': {e}", fields::SUBSCRIBER_ID))?
            .to_string();

        let tracking_field = match document.get(fields::TRACKING_FIELD) {
            Some(Bson::String(s)) => Some(s.clone()),
            Some(Bson::Null) | None => None,
            Some(other) => {
                return Err(format!(
                    "invalid '{}': expected string, found {other}",
                    fields::TRACKING_FIELD
                ))
            }
        };

        let last_value = if let Ok(token) = document.get_document(fields::RESUME_TOKEN) {
            SourcePosition::ResumeToken(token.clone())
        } else {
            let value = document
                .get(value_field)
                .ok_or_else(|| format!("missing '{value_field}'"))?;
            SourcePosition::Value(value.clone())
        };

        let updated_at = document
            .get_datetime(fields::UPDATED_AT)
            .ok()
            .and_then(|dt| DateTime::from_timestamp_millis(dt.timestamp_millis()))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            subscriber_id,
            tracking_field,
            last_value,
            updated_at,
        })
    }
}

/// Orders two tracking values.
///
/// Numbers compare across BSON numeric types. Strings, dates, timestamps,
/// ObjectIds and booleans compare with their own kind. Anything else is
/// incomparable and yields `None`.
#[must_use]
pub fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(x.cmp(y)),
        (Bson::Int64(x), Bson::Int64(y)) => Some(x.cmp(y)),
        (Bson::Int32(x), Bson::Int64(y)) => Some(i64::from(*x).cmp(y)),
        (Bson::Int64(x), Bson::Int32(y)) => Some(x.cmp(&i64::from(*y))),
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            Some((x.time, x.increment).cmp(&(y.time, y.increment)))
        }
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        _ => as_f64(a)?.partial_cmp(&as_f64(b)?),
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}
