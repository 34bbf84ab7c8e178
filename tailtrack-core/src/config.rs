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

//! Subscription configuration.
//!
//! A [`SubscriptionConfig`] is built either in code through
//! [`SubscriptionConfig::builder`] or from a string option map with
//! [`SubscriptionConfig::from_options`], which mirrors the endpoint option
//! names (`consumerType`, `trackingField`, `persistentTailTracking`, ...)
//! and rejects keys it does not know.
//!
//! ```rust
//! use tailtrack_core::config::{ConsumerType, SubscriptionConfig};
//!
//! let config = SubscriptionConfig::from_options([
//!     ("collection", "capped"),
//!     ("trackingField", "increasing"),
//!     ("persistentTailTracking", "true"),
//!     ("persistentId", "darwin"),
//! ])
//! .unwrap();
//!
//! assert_eq!(config.consumer_type, ConsumerType::Tailable);
//! assert_eq!(config.subscriber_id(), "darwin");
//! ```

use crate::filter::{EventFilter, FilterError, MatchFilter};
use crate::source::CursorSource;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Option name is not recognised
    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    /// Option value could not be parsed
    #[error("Invalid value '{value}' for option '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Required option is missing
    #[error("Missing required option '{0}'")]
    Missing(String),

    /// Options are individually valid but inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Stream filter expression is invalid
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Which cursor source variant a subscription uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerType {
    /// Tailable cursor over a capped collection, positioned by tracking field.
    #[default]
    Tailable,
    /// Change stream, positioned by resume token.
    ChangeStreams,
}

impl FromStr for ConsumerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tailable" => Ok(Self::Tailable),
            "changeStreams" => Ok(Self::ChangeStreams),
            other => Err(format!(
                "expected 'tailable' or 'changeStreams', found '{other}'"
            )),
        }
    }
}

impl fmt::Display for ConsumerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tailable => f.write_str("tailable"),
            Self::ChangeStreams => f.write_str("changeStreams"),
        }
    }
}

/// Where to start when no stored position exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Oldest available record (tailable cursors only).
    Beginning,
    /// Only records appended after the subscription starts.
    Now,
}

impl FromStr for StartFrom {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginning" => Ok(Self::Beginning),
            "now" => Ok(Self::Now),
            other => Err(format!("expected 'beginning' or 'now', found '{other}'")),
        }
    }
}

/// What the consumer does when the handler rejects an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerFailurePolicy {
    /// Keep the position before the failing event and stop the subscription.
    #[default]
    Stop,
    /// Count the failure, advance past the event and continue.
    Skip,
}

impl FromStr for HandlerFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "skip" => Ok(Self::Skip),
            other => Err(format!("expected 'stop' or 'skip', found '{other}'")),
        }
    }
}

/// Location of persisted positions in a MongoDB tracking collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingStoreLocation {
    /// Database holding the tracking collection; `None` uses the source database
    pub database: Option<String>,

    /// Tracking collection name
    pub collection: String,

    /// Field holding the last tracked value
    pub field: String,
}

impl Default for TrackingStoreLocation {
    fn default() -> Self {
        Self {
            database: None,
            collection: "tailTracking".to_string(),
            field: crate::position::fields::LAST_VALUE.to_string(),
        }
    }
}

/// Exponential backoff with jitter used for reconnects and deferred
/// checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Initial backoff in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    pub max_backoff_ms: u64,

    /// Maximum number of consecutive failures before giving up (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Backoff jitter factor (0.0 to 1.0)
    pub backoff_jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            max_reconnect_attempts: 5,
            backoff_jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Validates the backoff parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `initial_backoff_ms` is 0
    /// - `initial_backoff_ms` > `max_backoff_ms`
    /// - `backoff_jitter` is not in range [0.0, 1.0]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "initial_backoff_ms ({}) must be <= max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff_jitter ({}) must be between 0.0 and 1.0",
                self.backoff_jitter
            )));
        }

        Ok(())
    }

    /// Returns true once `failures` consecutive failures exhaust the budget.
    #[must_use]
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_reconnect_attempts > 0 && failures > self.max_reconnect_attempts
    }

    /// Calculates backoff duration with jitter for the given attempt.
    ///
    /// Uses exponential backoff: `initial_ms * 2^(attempt-1)`, capped at `max_backoff_ms`.
    /// Adds random jitter to prevent thundering herd: ±(base * jitter_factor / 2).
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let base_ms = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);

        if self.backoff_jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.backoff_jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            let final_ms = ((base_ms as f64) + jitter).max(0.0) as u64;
            Duration::from_millis(final_ms)
        } else {
            Duration::from_millis(base_ms)
        }
    }
}

/// Configuration of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Source collection name
    pub collection: String,

    /// Cursor source variant
    pub consumer_type: ConsumerType,

    /// Monotonic field used by tailable cursors
    pub tracking_field: Option<String>,

    /// Whether positions are loaded from and saved to the position store
    pub persistent: bool,

    /// Subscriber id under which the position is stored
    pub persistent_id: Option<String>,

    /// Where a MongoDB position store keeps positions
    pub tracking_store: TrackingStoreLocation,

    /// Predicate applied before delivery
    pub filter: Option<Arc<dyn EventFilter>>,

    /// Bounded wait for each `next()` call
    pub poll_timeout: Duration,

    /// Start point when no position is stored
    pub start_from: StartFrom,

    /// Reconnect and checkpoint retry backoff
    pub backoff: BackoffConfig,

    /// How long `open` keeps retrying a missing or unreachable source
    pub open_timeout: Duration,

    /// TTL of the subscriber lock in the position store
    pub lock_ttl: Duration,

    /// Behaviour on handler failure
    pub handler_failure_policy: HandlerFailurePolicy,
}

/// Recognised option names for [`SubscriptionConfig::from_options`].
pub const OPTION_KEYS: &[&str] = &[
    "collection",
    "consumerType",
    "trackingField",
    "persistentTailTracking",
    "persistentId",
    "tailTrackDb",
    "tailTrackCollection",
    "tailTrackField",
    "streamFilter",
    "pollTimeoutMs",
    "startFrom",
    "initialBackoffMs",
    "maxBackoffMs",
    "backoffJitter",
    "maxReconnectAttempts",
    "openTimeoutMs",
    "lockTtlMs",
    "handlerFailurePolicy",
];

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

impl SubscriptionConfig {
    /// Creates a new builder for `SubscriptionConfig`.
    #[must_use]
    pub fn builder() -> SubscriptionConfigBuilder {
        SubscriptionConfigBuilder::default()
    }

    /// Builds a configuration from named string options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownOption`] for unrecognised keys,
    /// [`ConfigError::InvalidValue`] for unparsable values, and any
    /// validation error from [`SubscriptionConfigBuilder::build`].
    pub fn from_options<I, K, V>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = Self::builder();

        for (key, value) in options {
            let (key, value) = (key.as_ref(), value.as_ref());
            builder = match key {
                "collection" => builder.collection(value),
                "consumerType" => builder.consumer_type(parse_value(key, value)?),
                "trackingField" => builder.tracking_field(value),
                "persistentTailTracking" => builder.persistent(parse_value(key, value)?),
                "persistentId" => builder.persistent_id(value),
                "tailTrackDb" => builder.tail_track_db(value),
                "tailTrackCollection" => builder.tail_track_collection(value),
                "tailTrackField" => builder.tail_track_field(value),
                "streamFilter" => builder.stream_filter(value),
                "pollTimeoutMs" => {
                    builder.poll_timeout(Duration::from_millis(parse_value(key, value)?))
                }
                "startFrom" => builder.start_from(parse_value(key, value)?),
                "initialBackoffMs" => builder.initial_backoff_ms(parse_value(key, value)?),
                "maxBackoffMs" => builder.max_backoff_ms(parse_value(key, value)?),
                "backoffJitter" => builder.backoff_jitter(parse_value(key, value)?),
                "maxReconnectAttempts" => builder.max_reconnect_attempts(parse_value(key, value)?),
                "openTimeoutMs" => {
                    builder.open_timeout(Duration::from_millis(parse_value(key, value)?))
                }
                "lockTtlMs" => builder.lock_ttl(Duration::from_millis(parse_value(key, value)?)),
                "handlerFailurePolicy" => {
                    builder.handler_failure_policy(parse_value(key, value)?)
                }
                unknown => return Err(ConfigError::UnknownOption(unknown.to_string())),
            };
        }

        builder.build()
    }

    /// Id under which this subscription is registered and persisted.
    ///
    /// Falls back to the collection name when no `persistentId` is set.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        self.persistent_id.as_deref().unwrap_or(&self.collection)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.is_empty() {
            return Err(ConfigError::Missing("collection".to_string()));
        }

        match self.consumer_type {
            ConsumerType::Tailable => {
                if self.tracking_field.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::Missing("trackingField".to_string()));
                }
            }
            ConsumerType::ChangeStreams => {
                if self.tracking_field.is_some() {
                    return Err(ConfigError::Invalid(
                        "trackingField cannot be used with change streams".to_string(),
                    ));
                }
                if self.start_from == StartFrom::Beginning {
                    return Err(ConfigError::Invalid(
                        "change streams cannot start from the beginning".to_string(),
                    ));
                }
            }
        }

        if self.persistent && self.persistent_id.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("persistentId".to_string()));
        }

        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "pollTimeoutMs must be greater than 0".to_string(),
            ));
        }

        if self.lock_ttl <= self.poll_timeout {
            return Err(ConfigError::Invalid(format!(
                "lockTtlMs ({}) must be greater than pollTimeoutMs ({})",
                self.lock_ttl.as_millis(),
                self.poll_timeout.as_millis()
            )));
        }

        self.backoff.validate()
    }

    /// Checks that `source` reads what this configuration describes: the
    /// same collection, the same kind of cursor and the same tracking field.
    ///
    /// Positions written through a mismatched source would be unreadable, or
    /// silently wrong, on the next start.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on the first mismatch.
    pub fn check_source(&self, source: &dyn CursorSource) -> Result<(), ConfigError> {
        if source.consumer_type() != self.consumer_type {
            return Err(ConfigError::Invalid(format!(
                "consumerType is {} but the source is a {} source",
                self.consumer_type,
                source.consumer_type()
            )));
        }
        if source.name() != self.collection {
            return Err(ConfigError::Invalid(format!(
                "collection is '{}' but the source reads '{}'",
                self.collection,
                source.name()
            )));
        }
        if source.tracking_field() != self.tracking_field.as_deref() {
            return Err(ConfigError::Invalid(format!(
                "trackingField is {:?} but the source tracks {:?}",
                self.tracking_field,
                source.tracking_field()
            )));
        }
        Ok(())
    }
}

/// Builder for `SubscriptionConfig`.
#[derive(Debug, Default)]
pub struct SubscriptionConfigBuilder {
    collection: Option<String>,
    consumer_type: ConsumerType,
    tracking_field: Option<String>,
    persistent: bool,
    persistent_id: Option<String>,
    tracking_store: TrackingStoreLocation,
    filter: Option<Arc<dyn EventFilter>>,
    stream_filter: Option<String>,
    poll_timeout: Option<Duration>,
    start_from: Option<StartFrom>,
    backoff: BackoffConfig,
    open_timeout: Option<Duration>,
    lock_ttl: Option<Duration>,
    handler_failure_policy: HandlerFailurePolicy,
}

impl SubscriptionConfigBuilder {
    /// Sets the source collection.
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Sets the cursor source variant.
    ///
    /// Default: [`ConsumerType::Tailable`]
    #[must_use]
    pub fn consumer_type(mut self, consumer_type: ConsumerType) -> Self {
        self.consumer_type = consumer_type;
        self
    }

    /// Sets the monotonic tracking field (tailable cursors).
    #[must_use]
    pub fn tracking_field(mut self, field: impl Into<String>) -> Self {
        self.tracking_field = Some(field.into());
        self
    }

    /// Enables or disables persistent position tracking.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Sets the subscriber id.
    #[must_use]
    pub fn persistent_id(mut self, id: impl Into<String>) -> Self {
        self.persistent_id = Some(id.into());
        self
    }

    /// Sets the database of the tracking collection.
    #[must_use]
    pub fn tail_track_db(mut self, database: impl Into<String>) -> Self {
        self.tracking_store.database = Some(database.into());
        self
    }

    /// Sets the tracking collection.
    ///
    /// Default: `tailTracking`
    #[must_use]
    pub fn tail_track_collection(mut self, collection: impl Into<String>) -> Self {
        self.tracking_store.collection = collection.into();
        self
    }

    /// Sets the field holding the last tracked value.
    ///
    /// Default: `lastTrackingValue`
    #[must_use]
    pub fn tail_track_field(mut self, field: impl Into<String>) -> Self {
        self.tracking_store.field = field.into();
        self
    }

    /// Sets a programmatic event filter.
    #[must_use]
    pub fn filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sets a `$match`-style filter expression, parsed at build time.
    #[must_use]
    pub fn stream_filter(mut self, expression: impl Into<String>) -> Self {
        self.stream_filter = Some(expression.into());
        self
    }

    /// Sets the bounded wait for each `next()` call.
    ///
    /// Default: 1 second
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Sets where to start when no position is stored.
    ///
    /// Default: `Beginning` for tailable cursors, `Now` for change streams
    #[must_use]
    pub fn start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = Some(start_from);
        self
    }

    /// Replaces the whole backoff configuration.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the initial backoff duration in milliseconds.
    ///
    /// Default: 100ms
    #[must_use]
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.backoff.initial_backoff_ms = ms;
        self
    }

    /// Sets the maximum backoff duration in milliseconds.
    ///
    /// Default: 30,000ms (30 seconds)
    #[must_use]
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.backoff.max_backoff_ms = ms;
        self
    }

    /// Sets the maximum number of consecutive reconnect failures.
    ///
    /// Set to 0 for infinite retries (use with caution).
    /// Default: 5
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.backoff.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the backoff jitter factor (0.0 to 1.0).
    ///
    /// Default: 0.1
    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff.backoff_jitter = jitter;
        self
    }

    /// Sets how long `open` keeps retrying a missing or unreachable source.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    /// Sets the TTL of the subscriber lock.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    /// Sets the handler failure policy.
    ///
    /// Default: [`HandlerFailurePolicy::Stop`]
    #[must_use]
    pub fn handler_failure_policy(mut self, policy: HandlerFailurePolicy) -> Self {
        self.handler_failure_policy = policy;
        self
    }

    /// Builds and validates the `SubscriptionConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a required option is missing, the stream filter
    /// does not parse, or the options are inconsistent.
    pub fn build(self) -> Result<SubscriptionConfig, ConfigError> {
        let collection = self
            .collection
            .ok_or_else(|| ConfigError::Missing("collection".to_string()))?;

        let filter = match (self.filter, self.stream_filter) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "filter and streamFilter are mutually exclusive".to_string(),
                ))
            }
            (Some(filter), None) => Some(filter),
            (None, Some(expression)) => {
                Some(Arc::new(MatchFilter::parse(&expression)?) as Arc<dyn EventFilter>)
            }
            (None, None) => None,
        };

        let start_from = self.start_from.unwrap_or(match self.consumer_type {
            ConsumerType::Tailable => StartFrom::Beginning,
            ConsumerType::ChangeStreams => StartFrom::Now,
        });

        let config = SubscriptionConfig {
            collection,
            consumer_type: self.consumer_type,
            tracking_field: self.tracking_field,
            persistent: self.persistent,
            persistent_id: self.persistent_id,
            tracking_store: self.tracking_store,
            filter,
            poll_timeout: self.poll_timeout.unwrap_or(Duration::from_secs(1)),
            start_from,
            backoff: self.backoff,
            open_timeout: self.open_timeout.unwrap_or(Duration::from_secs(30)),
            lock_ttl: self.lock_ttl.unwrap_or(Duration::from_secs(30)),
            handler_failure_policy: self.handler_failure_policy,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tailable_defaults() {
        let config = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .build()
            .unwrap();

        assert_eq!(config.consumer_type, ConsumerType::Tailable);
        assert_eq!(config.start_from, StartFrom::Beginning);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(config.tracking_store, TrackingStoreLocation::default());
        assert_eq!(config.tracking_store.collection, "tailTracking");
        assert_eq!(config.tracking_store.field, "lastTrackingValue");
        assert_eq!(config.handler_failure_policy, HandlerFailurePolicy::Stop);
        assert!(!config.persistent);
        assert_eq!(config.subscriber_id(), "capped");
    }

    #[test]
    fn test_change_streams_default_to_now() {
        let config = SubscriptionConfig::builder()
            .collection("docs")
            .consumer_type(ConsumerType::ChangeStreams)
            .build()
            .unwrap();
        assert_eq!(config.start_from, StartFrom::Now);
    }

    #[test]
    fn test_tailable_requires_tracking_field() {
        let err = SubscriptionConfig::builder()
            .collection("capped")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("trackingField".to_string()));
    }

    #[test]
    fn test_change_streams_reject_tracking_field_and_beginning() {
        let err = SubscriptionConfig::builder()
            .collection("docs")
            .consumer_type(ConsumerType::ChangeStreams)
            .tracking_field("increasing")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = SubscriptionConfig::builder()
            .collection("docs")
            .consumer_type(ConsumerType::ChangeStreams)
            .start_from(StartFrom::Beginning)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_persistent_requires_id() {
        let err = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .persistent(true)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("persistentId".to_string()));
    }

    #[test]
    fn test_from_options_full_surface() {
        let config = SubscriptionConfig::from_options([
            ("collection", "capped"),
            ("consumerType", "tailable"),
            ("trackingField", "increasing"),
            ("persistentTailTracking", "true"),
            ("persistentId", "darwin"),
            ("tailTrackDb", "einstein"),
            ("tailTrackCollection", "darwin"),
            ("tailTrackField", "newton"),
            ("streamFilter", r#"{"increasing": {"$gt": 10}}"#),
            ("pollTimeoutMs", "250"),
            ("startFrom", "now"),
            ("initialBackoffMs", "10"),
            ("maxBackoffMs", "1000"),
            ("backoffJitter", "0"),
            ("maxReconnectAttempts", "3"),
            ("openTimeoutMs", "5000"),
            ("lockTtlMs", "10000"),
            ("handlerFailurePolicy", "skip"),
        ])
        .unwrap();

        assert_eq!(config.subscriber_id(), "darwin");
        assert_eq!(
            config.tracking_store,
            TrackingStoreLocation {
                database: Some("einstein".to_string()),
                collection: "darwin".to_string(),
                field: "newton".to_string(),
            }
        );
        assert!(config.filter.is_some());
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.start_from, StartFrom::Now);
        assert_eq!(config.backoff.max_reconnect_attempts, 3);
        assert_eq!(config.open_timeout, Duration::from_secs(5));
        assert_eq!(config.handler_failure_policy, HandlerFailurePolicy::Skip);
    }

    #[test]
    fn test_from_options_rejects_unknown_keys() {
        let err = SubscriptionConfig::from_options([
            ("collection", "capped"),
            ("trackingField", "increasing"),
            ("tailTrackIncrement", "1"),
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::UnknownOption("tailTrackIncrement".to_string()));
    }

    #[test]
    fn test_from_options_rejects_bad_values() {
        let err = SubscriptionConfig::from_options([
            ("collection", "capped"),
            ("trackingField", "increasing"),
            ("pollTimeoutMs", "soon"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "pollTimeoutMs"));

        let err = SubscriptionConfig::from_options([("consumerType", "oplog")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_invalid_stream_filter() {
        let err = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .stream_filter(r#"{"a": {"$regex": "x"}}"#)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Filter(_)));
    }

    #[test]
    fn test_lock_ttl_must_exceed_poll_timeout() {
        let err = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .poll_timeout(Duration::from_secs(5))
            .lock_ttl(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_backoff_validation() {
        let backoff = BackoffConfig {
            initial_backoff_ms: 0,
            ..BackoffConfig::default()
        };
        assert!(backoff.validate().is_err());

        let backoff = BackoffConfig {
            initial_backoff_ms: 1000,
            max_backoff_ms: 100,
            ..BackoffConfig::default()
        };
        assert!(backoff.validate().is_err());

        let backoff = BackoffConfig {
            backoff_jitter: 1.5,
            ..BackoffConfig::default()
        };
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_calculate_backoff_without_jitter() {
        let backoff = BackoffConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_jitter: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.calculate_backoff(1), Duration::from_millis(100));
        assert_eq!(backoff.calculate_backoff(2), Duration::from_millis(200));
        assert_eq!(backoff.calculate_backoff(4), Duration::from_millis(800));
        assert_eq!(backoff.calculate_backoff(5), Duration::from_millis(1000));
        assert_eq!(backoff.calculate_backoff(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_backoff_jitter_bounds() {
        let backoff = BackoffConfig::default();
        for _ in 0..100 {
            let ms = backoff.calculate_backoff(1).as_millis();
            assert!((95..=105).contains(&ms), "backoff {ms} out of range");
        }
    }

    #[test]
    fn test_exhausted() {
        let backoff = BackoffConfig::default();
        assert!(!backoff.exhausted(5));
        assert!(backoff.exhausted(6));

        let unlimited = BackoffConfig {
            max_reconnect_attempts: 0,
            ..BackoffConfig::default()
        };
        assert!(!unlimited.exhausted(u32::MAX));
    }

    #[test]
    fn test_check_source() {
        use crate::source::MemoryLog;

        let log = MemoryLog::new("capped");
        let tailable = SubscriptionConfig::builder()
            .collection("capped")
            .tracking_field("increasing")
            .build()
            .unwrap();
        assert!(tailable.check_source(&log.tailable("increasing")).is_ok());

        let err = tailable.check_source(&log.tailable("seq")).unwrap_err();
        assert!(err.to_string().contains("trackingField"));

        let err = tailable.check_source(&log.change_stream()).unwrap_err();
        assert!(err.to_string().contains("consumerType"));

        let other = MemoryLog::new("orders");
        let err = tailable.check_source(&other.tailable("increasing")).unwrap_err();
        assert!(err.to_string().contains("collection"));

        let stream = SubscriptionConfig::builder()
            .collection("capped")
            .consumer_type(ConsumerType::ChangeStreams)
            .build()
            .unwrap();
        assert!(stream.check_source(&log.change_stream()).is_ok());
        assert!(stream.check_source(&log.tailable("increasing")).is_err());
    }
}
