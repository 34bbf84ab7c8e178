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

//! Tests for metrics instrumentation module.

use tailtrack_core::metrics::{
    LockFailureReason, Timer, CHECKPOINTS_TOTAL, EVENTS_DELIVERED_TOTAL, HANDLER_DURATION_SECONDS,
    METRIC_PREFIX,
};
use tailtrack_core::ConsumerState;

#[test]
fn test_metric_names() {
    for name in [EVENTS_DELIVERED_TOTAL, CHECKPOINTS_TOTAL] {
        assert!(name.starts_with(METRIC_PREFIX));
        assert!(name.ends_with("_total"));
    }
    assert!(HANDLER_DURATION_SECONDS.starts_with(METRIC_PREFIX));
    assert!(HANDLER_DURATION_SECONDS.ends_with("_seconds"));
}

#[test]
fn test_subscription_status_values() {
    assert_eq!(ConsumerState::Stopped as u8, 0);
    assert_eq!(ConsumerState::Starting as u8, 1);
    assert_eq!(ConsumerState::Running as u8, 2);
    assert_eq!(ConsumerState::Error as u8, 3);
    assert_eq!(ConsumerState::Stopping as u8, 4);
}

#[test]
fn test_lock_failure_labels() {
    assert_eq!(LockFailureReason::AlreadyHeld.as_str(), "already_held");
    assert_eq!(LockFailureReason::Error.as_str(), "error");
}

#[test]
fn test_recording_without_recorder_is_noop() {
    tailtrack_core::metrics::init_metrics();
    tailtrack_core::metrics::increment_events_delivered("sub", "insert");
    tailtrack_core::metrics::set_subscription_status("sub", ConsumerState::Running);
    tailtrack_core::metrics::set_active_subscriptions(1);
}

#[test]
fn test_timer() {
    use std::thread;
    use std::time::Duration;

    let recorded = std::sync::Arc::new(std::sync::Mutex::new(None));
    let recorded_clone = recorded.clone();

    {
        let _timer = Timer::new("sub", move |duration, label| {
            *recorded_clone.lock().unwrap() = Some((duration, label.to_string()));
        });
        thread::sleep(Duration::from_millis(10));
    }

    let (duration, label) = recorded.lock().unwrap().clone().unwrap();
    assert!(duration.as_millis() >= 10);
    assert_eq!(label, "sub");
}
