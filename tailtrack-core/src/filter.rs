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

//! Event filtering.
//!
//! An [`EventFilter`] is a pure predicate evaluated before delivery. A
//! subscription without a filter delivers every event.
//!
//! [`MatchFilter`] evaluates a `$match`-style query expression, which is what
//! the `streamFilter` option carries:
//!
//! ```rust
//! use bson::{doc, Bson};
//! use tailtrack_core::event::{Event, OperationType};
//! use tailtrack_core::filter::{EventFilter, MatchFilter};
//!
//! let filter = MatchFilter::parse(
//!     r#"{"$match": {"$or": [{"fullDocument.string": "value2"}, {"fullDocument.string": {"$exists": false}}]}}"#,
//! ).unwrap();
//!
//! let insert = Event::change(
//!     OperationType::Insert,
//!     doc! { "_id": 1, "string": "value1" },
//!     Some(Bson::Int32(1)),
//!     doc! { "_data": "01" },
//! );
//! assert!(!filter.matches(&insert));
//! ```
//!
//! Filtering never changes how far a subscription has read: the consumer
//! advances its position for filtered-out events too, so they are not seen
//! again after a restart.

use crate::event::{lookup_path, Event};
use crate::position::compare_values;
use bson::{Bson, Document};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Predicate deciding whether an event is delivered downstream.
pub trait EventFilter: Send + Sync + fmt::Debug {
    /// Returns true if the event should be delivered.
    fn matches(&self, event: &Event) -> bool;
}

/// Errors raised while building a filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Expression is not valid JSON / extended JSON
    #[error("invalid filter expression: {0}")]
    InvalidExpression(String),

    /// Operator is not supported
    #[error("unsupported filter operator '{0}'")]
    UnsupportedOperator(String),

    /// Operator used with a value of the wrong shape
    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// Filter backed by a closure.
pub struct FnFilter<F> {
    name: &'static str,
    predicate: F,
}

impl<F> FnFilter<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    /// Wraps a closure; `name` is used for debug output only.
    pub fn new(name: &'static str, predicate: F) -> Self {
        Self { name, predicate }
    }
}

impl<F> fmt::Debug for FnFilter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFilter").field("name", &self.name).finish()
    }
}

impl<F> EventFilter for FnFilter<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn matches(&self, event: &Event) -> bool {
        (self.predicate)(event)
    }
}

/// `$match`-style query expression.
///
/// Supported: implicit equality, `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
/// `$in`, `$nin`, `$exists`, `$not`, and the logical `$and`, `$or`, `$nor`.
/// Field names may be dotted paths. An outer `{"$match": {...}}` wrapper is
/// accepted and unwrapped.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchFilter {
    expression: Document,
}

impl MatchFilter {
    /// Builds a filter from an expression document.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression uses an unknown operator or an
    /// operator with a value of the wrong shape.
    pub fn new(expression: Document) -> Result<Self, FilterError> {
        let expression = match expression.get("$match") {
            Some(Bson::Document(inner)) if expression.len() == 1 => inner.clone(),
            Some(_) if expression.len() == 1 => {
                return Err(FilterError::Malformed("$match expects a document".into()))
            }
            _ => expression,
        };
        validate_query(&expression)?;
        Ok(Self { expression })
    }

    /// Parses a filter from (extended) JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidExpression`] if the text is not a JSON
    /// object, or any error from [`MatchFilter::new`].
    pub fn parse(json: &str) -> Result<Self, FilterError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| FilterError::InvalidExpression(e.to_string()))?;
        match Bson::try_from(value) {
            Ok(Bson::Document(doc)) => Self::new(doc),
            Ok(other) => Err(FilterError::InvalidExpression(format!(
                "expected an object, found {other}"
            ))),
            Err(e) => Err(FilterError::InvalidExpression(e.to_string())),
        }
    }

    /// Returns the (unwrapped) expression.
    #[must_use]
    pub fn expression(&self) -> &Document {
        &self.expression
    }

    /// Evaluates the expression against a document.
    #[must_use]
    pub fn matches_document(&self, document: &Document) -> bool {
        query_matches(&self.expression, document)
    }
}

impl EventFilter for MatchFilter {
    fn matches(&self, event: &Event) -> bool {
        self.matches_document(&event.filter_view())
    }
}

const LOGICAL: [&str; 3] = ["$and", "$or", "$nor"];
const COMPARISON: [&str; 10] = [
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$not",
];

fn is_operator_document(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

fn validate_query(query: &Document) -> Result<(), FilterError> {
    for (key, value) in query {
        if LOGICAL.contains(&key.as_str()) {
            let Bson::Array(clauses) = value else {
                return Err(FilterError::Malformed(format!("{key} expects an array")));
            };
            if clauses.is_empty() {
                return Err(FilterError::Malformed(format!("{key} expects a non-empty array")));
            }
            for clause in clauses {
                let Bson::Document(clause) = clause else {
                    return Err(FilterError::Malformed(format!("{key} clauses must be documents")));
                };
                validate_query(clause)?;
            }
        } else if key.starts_with('$') {
            return Err(FilterError::UnsupportedOperator(key.clone()));
        } else if let Bson::Document(ops) = value {
            if is_operator_document(ops) {
                validate_operators(ops)?;
            }
        }
    }
    Ok(())
}

fn validate_operators(ops: &Document) -> Result<(), FilterError> {
    for (op, operand) in ops {
        if !COMPARISON.contains(&op.as_str()) {
            return Err(FilterError::UnsupportedOperator(op.clone()));
        }
        match (op.as_str(), operand) {
            ("$in" | "$nin", Bson::Array(_)) => {}
            ("$in" | "$nin", _) => {
                return Err(FilterError::Malformed(format!("{op} expects an array")))
            }
            ("$not", Bson::Document(inner)) if is_operator_document(inner) => {
                validate_operators(inner)?;
            }
            ("$not", _) => {
                return Err(FilterError::Malformed(
                    "$not expects an operator document".into(),
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

fn query_matches(query: &Document, document: &Document) -> bool {
    query.iter().all(|(key, condition)| match key.as_str() {
        "$and" => clauses(condition).all(|c| query_matches(c, document)),
        "$or" => clauses(condition).any(|c| query_matches(c, document)),
        "$nor" => !clauses(condition).any(|c| query_matches(c, document)),
        path => field_matches(lookup_path(document, path), condition),
    })
}

fn clauses(value: &Bson) -> impl Iterator<Item = &Document> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Bson::as_document)
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> bool {
    match condition {
        Bson::Document(ops) if is_operator_document(ops) => {
            ops.iter().all(|(op, operand)| operator_matches(value, op, operand))
        }
        expected => values_equal(value, expected),
    }
}

fn operator_matches(value: Option<&Bson>, op: &str, operand: &Bson) -> bool {
    match op {
        "$eq" => values_equal(value, operand),
        "$ne" => !values_equal(value, operand),
        "$gt" => ordered(value, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(value, operand, |o| o != Ordering::Less),
        "$lt" => ordered(value, operand, |o| o == Ordering::Less),
        "$lte" => ordered(value, operand, |o| o != Ordering::Greater),
        "$in" => operand
            .as_array()
            .is_some_and(|items| items.iter().any(|item| values_equal(value, item))),
        "$nin" => !operand
            .as_array()
            .is_some_and(|items| items.iter().any(|item| values_equal(value, item))),
        "$exists" => value.is_some() == truthy(operand),
        "$not" => !field_matches(value, operand),
        _ => false,
    }
}

/// Equality with numeric coercion; arrays match if any element matches.
fn values_equal(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(actual) => {
            scalar_equal(actual, expected)
                || matches!(actual, Bson::Array(items) if items.iter().any(|i| scalar_equal(i, expected)))
        }
    }
}

fn scalar_equal(actual: &Bson, expected: &Bson) -> bool {
    actual == expected || compare_values(actual, expected) == Some(Ordering::Equal)
}

fn ordered(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    value
        .and_then(|v| compare_values(v, operand))
        .is_some_and(accept)
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(i) => *i != 0,
        Bson::Int64(i) => *i != 0,
        Bson::Double(d) => *d != 0.0,
        Bson::Null => false,
        _ => true,
    }
}
