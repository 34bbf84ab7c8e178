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

//! Metrics instrumentation.
//!
//! All metrics go through the [`metrics`] facade; install any recorder
//! (for example `metrics-exporter-prometheus`) to collect them. Without a
//! recorder every call is a no-op.
//!
//! # Metrics
//!
//! | name | type | labels |
//! |------|------|--------|
//! | `tailtrack_events_delivered_total` | counter | `subscriber`, `operation` |
//! | `tailtrack_events_filtered_total` | counter | `subscriber` |
//! | `tailtrack_handler_failures_total` | counter | `subscriber`, `policy` |
//! | `tailtrack_checkpoints_total` | counter | `subscriber` |
//! | `tailtrack_checkpoint_failures_total` | counter | `subscriber`, `error_type` |
//! | `tailtrack_reconnects_total` | counter | `subscriber`, `error_type` |
//! | `tailtrack_handler_duration_seconds` | histogram | `subscriber` |
//! | `tailtrack_active_subscriptions` | gauge | |
//! | `tailtrack_subscription_status` | gauge | `subscriber` |
//! | `tailtrack_lock_*` | counter | `reason` on failures |

use crate::consumer::ConsumerState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

#[doc(hidden)]
pub const METRIC_PREFIX: &str = "tailtrack";

#[doc(hidden)]
pub const EVENTS_DELIVERED_TOTAL: &str = "tailtrack_events_delivered_total";

const EVENTS_FILTERED_TOTAL: &str = "tailtrack_events_filtered_total";

const HANDLER_FAILURES_TOTAL: &str = "tailtrack_handler_failures_total";

#[doc(hidden)]
pub const CHECKPOINTS_TOTAL: &str = "tailtrack_checkpoints_total";

const CHECKPOINT_FAILURES_TOTAL: &str = "tailtrack_checkpoint_failures_total";

const RECONNECTS_TOTAL: &str = "tailtrack_reconnects_total";

#[doc(hidden)]
pub const HANDLER_DURATION_SECONDS: &str = "tailtrack_handler_duration_seconds";

const ACTIVE_SUBSCRIPTIONS: &str = "tailtrack_active_subscriptions";

const SUBSCRIPTION_STATUS: &str = "tailtrack_subscription_status";

const LOCK_ACQUISITIONS_TOTAL: &str = "tailtrack_lock_acquisitions_total";

const LOCK_ACQUISITION_FAILURES_TOTAL: &str = "tailtrack_lock_acquisition_failures_total";

const LOCKS_LOST_TOTAL: &str = "tailtrack_locks_lost_total";

const LOCK_REFRESHES_TOTAL: &str = "tailtrack_lock_refreshes_total";

const LOCKS_RELEASED_TOTAL: &str = "tailtrack_locks_released_total";

/// Registers descriptions for every metric. Call once after installing a
/// recorder.
pub fn init_metrics() {
    // Counters
    describe_counter!(
        EVENTS_DELIVERED_TOTAL,
        "Total number of events successfully delivered to a handler"
    );

    describe_counter!(
        EVENTS_FILTERED_TOTAL,
        "Total number of events rejected by the subscription filter"
    );

    describe_counter!(
        HANDLER_FAILURES_TOTAL,
        "Total number of events the handler failed to process"
    );

    describe_counter!(
        CHECKPOINTS_TOTAL,
        "Total number of positions persisted to the position store"
    );

    describe_counter!(
        CHECKPOINT_FAILURES_TOTAL,
        "Total number of deferred checkpoints caused by position store errors"
    );

    describe_counter!(
        RECONNECTS_TOTAL,
        "Total number of cursor reopen attempts after a closed or failed cursor"
    );

    // Histograms
    describe_histogram!(
        HANDLER_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time spent in the handler per delivered event"
    );

    // Gauges
    describe_gauge!(
        ACTIVE_SUBSCRIPTIONS,
        metrics::Unit::Count,
        "Number of subscriptions registered with the controller"
    );

    describe_gauge!(
        SUBSCRIPTION_STATUS,
        "Current subscription state: 0=stopped, 1=starting, 2=running, 3=error, 4=stopping"
    );

    // Subscriber locks
    describe_counter!(
        LOCK_ACQUISITIONS_TOTAL,
        "Total number of successful subscriber lock acquisitions"
    );

    describe_counter!(
        LOCK_ACQUISITION_FAILURES_TOTAL,
        "Total number of failed subscriber lock acquisition attempts"
    );

    describe_counter!(
        LOCKS_LOST_TOTAL,
        "Total number of subscriber locks lost (expired or taken by another instance)"
    );

    describe_counter!(
        LOCK_REFRESHES_TOTAL,
        "Total number of successful subscriber lock refreshes"
    );

    describe_counter!(
        LOCKS_RELEASED_TOTAL,
        "Total number of subscriber locks released gracefully"
    );
}

pub fn increment_events_delivered(subscriber: &str, operation: &str) {
    counter!(EVENTS_DELIVERED_TOTAL, "subscriber" => subscriber.to_string(), "operation" => operation.to_string())
        .increment(1);
}

pub fn increment_events_filtered(subscriber: &str) {
    counter!(EVENTS_FILTERED_TOTAL, "subscriber" => subscriber.to_string()).increment(1);
}

pub fn increment_handler_failures(subscriber: &str, policy: &'static str) {
    counter!(HANDLER_FAILURES_TOTAL, "subscriber" => subscriber.to_string(), "policy" => policy)
        .increment(1);
}

pub fn increment_checkpoints(subscriber: &str) {
    counter!(CHECKPOINTS_TOTAL, "subscriber" => subscriber.to_string()).increment(1);
}

pub fn increment_checkpoint_failures(subscriber: &str, error_type: &'static str) {
    counter!(
        CHECKPOINT_FAILURES_TOTAL,
        "subscriber" => subscriber.to_string(),
        "error_type" => error_type
    )
    .increment(1);
}

pub fn increment_reconnects(subscriber: &str, error_type: &'static str) {
    counter!(RECONNECTS_TOTAL, "subscriber" => subscriber.to_string(), "error_type" => error_type)
        .increment(1);
}

pub fn record_handler_duration(duration: Duration, subscriber: &str) {
    histogram!(HANDLER_DURATION_SECONDS, "subscriber" => subscriber.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_active_subscriptions(count: usize) {
    gauge!(ACTIVE_SUBSCRIPTIONS).set(count as f64);
}

pub fn set_subscription_status(subscriber: &str, state: ConsumerState) {
    gauge!(SUBSCRIPTION_STATUS, "subscriber" => subscriber.to_string())
        .set(f64::from(state as u8));
}

pub fn increment_lock_acquisitions() {
    counter!(LOCK_ACQUISITIONS_TOTAL).increment(1);
}

pub fn increment_lock_acquisition_failures(reason: LockFailureReason) {
    counter!(LOCK_ACQUISITION_FAILURES_TOTAL, "reason" => reason.as_str()).increment(1);
}

pub fn increment_locks_lost() {
    counter!(LOCKS_LOST_TOTAL).increment(1);
}

pub fn increment_lock_refreshes() {
    counter!(LOCK_REFRESHES_TOTAL).increment(1);
}

pub fn increment_locks_released() {
    counter!(LOCKS_RELEASED_TOTAL).increment(1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailureReason {
    /// Lock is already held by another instance.
    AlreadyHeld,
    /// Error communicating with the position store.
    Error,
}

impl LockFailureReason {
    /// Returns the reason as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyHeld => "already_held",
            Self::Error => "error",
        }
    }
}

/// Records the elapsed time through a callback when dropped.
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a new timer that will record the duration when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
