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

//! Downstream event handlers.
//!
//! A subscription delivers each matching event to one [`EventHandler`], in
//! source order, one at a time. The consumer only advances its position once
//! `handle` returns `Ok`, which gives at-least-once delivery: an event whose
//! delivery failed (or was interrupted by a crash) is seen again after a
//! restart.

use crate::event::Event;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Error returned by a handler that could not process an event.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler rejected the event.
    #[error("Handler failed: {message}")]
    Failed {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HandlerError {
    /// Creates a failure with a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps any error type.
    #[must_use]
    pub fn from_error(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Receives events from a subscription.
#[async_trait]
pub trait EventHandler: Send {
    /// Processes one event.
    ///
    /// # Errors
    ///
    /// Returning an error means the event was not processed; the position
    /// is not advanced past it unless the subscription skips failures.
    async fn handle(&mut self, event: &Event) -> Result<(), HandlerError>;

    /// Called once when the subscription stops.
    ///
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored.
    async fn close(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        "handler"
    }
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: FnMut(&Event) -> Result<(), HandlerError> + Send,
{
    /// Wraps a closure.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: FnMut(&Event) -> Result<(), HandlerError> + Send,
{
    async fn handle(&mut self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type FailurePredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Handler that records every delivered event.
///
/// Clones share the recorded events, so a test can keep one clone and hand
/// the other to a subscription.
///
/// ```rust
/// use tailtrack_core::handler::{CollectingHandler, EventHandler};
/// use tailtrack_core::event::Event;
/// use bson::doc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let handler = CollectingHandler::new();
/// let mut delivered = handler.clone();
///
/// let event = Event::tailed(doc! { "seq": 1 }, "seq").unwrap();
/// delivered.handle(&event).await.unwrap();
///
/// assert_eq!(handler.len().await, 1);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct CollectingHandler {
    events: Arc<Mutex<Vec<Event>>>,
    attempts: Arc<AtomicUsize>,
    close_count: Arc<AtomicUsize>,
    fail_after: Option<usize>,
    fail_when: Option<FailurePredicate>,
}

impl fmt::Debug for CollectingHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectingHandler")
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .field("fail_after", &self.fail_after)
            .field("fail_when", &self.fail_when.is_some())
            .finish_non_exhaustive()
    }
}

impl CollectingHandler {
    /// Creates an empty handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every delivery once `count` events have been accepted.
    #[must_use]
    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Fails deliveries of events matching `predicate`.
    #[must_use]
    pub fn fail_when(mut self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.fail_when = Some(Arc::new(predicate));
        self
    }

    /// Events accepted so far, in delivery order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Number of events accepted.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Returns true if no event was accepted.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of `handle` calls, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` events were accepted or `timeout` elapses.
    ///
    /// Returns true if the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len().await >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventHandler for CollectingHandler {
    async fn handle(&mut self, event: &Event) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut events = self.events.lock().await;

        if self.fail_after.is_some_and(|limit| events.len() >= limit) {
            return Err(HandlerError::msg("Simulated handler failure"));
        }
        if self.fail_when.as_ref().is_some_and(|p| p(event)) {
            return Err(HandlerError::msg("Simulated handler failure"));
        }

        events.push(event.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HandlerError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "collecting"
    }
}
