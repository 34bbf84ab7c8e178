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

//! Tail consumer loop.
//!
//! A [`TailConsumer`] owns one subscription: it loads the stored position,
//! opens the cursor source there, delivers events to the handler in source
//! order and checkpoints the position after every delivery.
//!
//! # State machine
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!                          |  ^
//!                          v  |
//!                          Error   (cursor closed or failed, reopening)
//! ```
//!
//! # Delivery guarantees
//!
//! The position only moves past an event after the handler accepted it (or
//! the filter rejected it), and it is saved right after every delivery. A
//! restart therefore resumes strictly after the last persisted position.
//! When the position store is down, deliveries continue and checkpoints are
//! retried later with backoff; the redelivery window after a crash grows
//! until a checkpoint succeeds, and every deferred checkpoint is logged and
//! counted.
//!
//! Shutdown is cooperative: the stop signal is observed between `next()`
//! calls, so [`TailConsumer::stop`] returns within one poll timeout plus
//! any in-flight delivery.

use crate::config::{ConfigError, ConsumerType, HandlerFailurePolicy, StartFrom, SubscriptionConfig};
use crate::event::{Event, SourcePosition};
use crate::handler::{EventHandler, HandlerError};
use crate::metrics;
use crate::position::Position;
use crate::source::{CursorHandle, CursorSource, Next, OpenFrom, SourceError};
use crate::state::{PositionStore, StoreError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsumerState {
    /// Not running.
    Stopped = 0,
    /// Loading the position and opening the source.
    Starting = 1,
    /// Reading events.
    Running = 2,
    /// Cursor closed or failed; waiting to reopen.
    Error = 3,
    /// Shutting down.
    Stopping = 4,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Counters for one subscription.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    /// Events accepted by the handler
    pub events_delivered: u64,

    /// Events rejected by the filter
    pub events_filtered: u64,

    /// Events the handler failed to process
    pub handler_failures: u64,

    /// Successful checkpoints
    pub checkpoints: u64,

    /// Deferred checkpoints
    pub checkpoint_failures: u64,

    /// Cursor reopen attempts
    pub reconnects: u64,

    /// Last position observed (delivered or filtered)
    pub last_position: Option<SourcePosition>,

    /// Error that stopped the subscription, if any
    pub last_error: Option<String>,
}

/// Errors that stop a subscription.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Source missing or unreachable beyond the open timeout
    #[error("Source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),

    /// Non-retryable source error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Position store could not be read, or the final checkpoint failed
    #[error("Position store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// The handler failed and the policy is to stop
    #[error("Handler failed for subscriber '{subscriber_id}': {source}")]
    HandlerFailure {
        subscriber_id: String,
        #[source]
        source: HandlerError,
    },

    /// Too many consecutive cursor failures
    #[error("Max reconnection attempts ({attempts}) exceeded: {source}")]
    ReconnectLimitExceeded {
        attempts: u32,
        #[source]
        source: SourceError,
    },

    /// A subscription with this id is already running
    #[error("Subscription '{0}' is already running")]
    AlreadyRunning(String),

    /// Another instance holds the subscriber lock
    #[error("Subscriber lock for '{0}' is held by another instance")]
    LockHeld(String),

    /// The subscriber lock expired or was taken over
    #[error("Subscriber lock for '{0}' was lost")]
    LockLost(String),

    /// No subscription with this id
    #[error("Subscription '{0}' not found")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The consumer task panicked or was cancelled
    #[error("Consumer task failed: {0}")]
    TaskFailed(String),
}

/// Subscriber lock held by a running consumer.
#[derive(Debug, Clone)]
pub(crate) struct LockLease {
    pub(crate) key: String,
    pub(crate) owner_id: String,
    pub(crate) ttl: Duration,
}

/// Handle to a running subscription.
pub struct TailConsumer {
    subscriber_id: String,
    state_rx: watch::Receiver<ConsumerState>,
    stats: Arc<RwLock<ConsumerStats>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ConsumerError>>>,
}

impl fmt::Debug for TailConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailConsumer")
            .field("subscriber_id", &self.subscriber_id)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl TailConsumer {
    /// Spawns the consumer loop on the current tokio runtime.
    ///
    /// The subscription is not registered with any controller and takes no
    /// subscriber lock; use
    /// [`LifecycleController`](crate::controller::LifecycleController) for
    /// mutual exclusion.
    #[must_use]
    pub fn start(
        config: SubscriptionConfig,
        source: Arc<dyn CursorSource>,
        store: Arc<dyn PositionStore>,
        handler: Box<dyn EventHandler>,
    ) -> Self {
        Self::spawn(config, source, store, handler, None)
    }

    pub(crate) fn spawn(
        config: SubscriptionConfig,
        source: Arc<dyn CursorSource>,
        store: Arc<dyn PositionStore>,
        handler: Box<dyn EventHandler>,
        lock: Option<LockLease>,
    ) -> Self {
        let subscriber_id = config.subscriber_id().to_string();
        let (state_tx, state_rx) = watch::channel(ConsumerState::Stopped);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(RwLock::new(ConsumerStats::default()));

        let worker = Worker {
            subscriber_id: subscriber_id.clone(),
            config,
            source,
            store,
            handler,
            state_tx,
            stats: Arc::clone(&stats),
            shutdown_rx,
            lock: lock.map(|lease| LockState {
                lease,
                refreshed_at: Instant::now(),
            }),
            position: None,
            dirty: false,
            failures: 0,
            checkpoint_failures: 0,
            retry_checkpoint_at: None,
        };

        let task = tokio::spawn(worker.run());

        Self {
            subscriber_id,
            state_rx,
            stats,
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Subscriber id of this subscription.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_rx.clone()
    }

    /// Snapshot of the subscription counters.
    pub async fn stats(&self) -> ConsumerStats {
        self.stats.read().await.clone()
    }

    /// Returns true once the loop has exited (after a stop or a fatal error).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits until the subscription reaches `state`.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_state(&self, state: ConsumerState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Signals the loop to stop and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the loop, if it stopped because of
    /// one, or [`ConsumerError::StoreUnavailable`] if the final checkpoint
    /// failed.
    #[instrument(skip(self), fields(subscriber = %self.subscriber_id))]
    pub async fn stop(&mut self) -> Result<ConsumerStats, ConsumerError> {
        self.shutdown_tx.send_replace(true);
        self.join().await
    }

    /// Waits for the loop to finish without signalling it.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the loop.
    pub async fn wait(&mut self) -> Result<ConsumerStats, ConsumerError> {
        self.join().await
    }

    async fn join(&mut self) -> Result<ConsumerStats, ConsumerError> {
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result?,
                Err(e) => return Err(ConsumerError::TaskFailed(e.to_string())),
            }
        }
        Ok(self.stats().await)
    }
}

struct LockState {
    lease: LockLease,
    refreshed_at: Instant,
}

struct Worker {
    subscriber_id: String,
    config: SubscriptionConfig,
    source: Arc<dyn CursorSource>,
    store: Arc<dyn PositionStore>,
    handler: Box<dyn EventHandler>,
    state_tx: watch::Sender<ConsumerState>,
    stats: Arc<RwLock<ConsumerStats>>,
    shutdown_rx: watch::Receiver<bool>,
    lock: Option<LockState>,
    /// In-memory position; ahead of the stored one while `dirty`.
    position: Option<Position>,
    dirty: bool,
    /// Consecutive cursor failures.
    failures: u32,
    /// Consecutive checkpoint failures.
    checkpoint_failures: u32,
    retry_checkpoint_at: Option<Instant>,
}

impl Worker {
    #[instrument(skip_all, fields(subscriber = %self.subscriber_id, collection = %self.config.collection))]
    async fn run(mut self) -> Result<(), ConsumerError> {
        info!(
            consumer_type = %self.config.consumer_type,
            persistent = self.config.persistent,
            "Starting subscription"
        );
        self.set_state(ConsumerState::Starting);

        let mut cursor: Option<Box<dyn CursorHandle>> = None;
        let mut result = match self.config.check_source(self.source.as_ref()) {
            Ok(()) => match self.load_position().await {
                Ok(()) => self.consume(&mut cursor).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };

        self.set_state(ConsumerState::Stopping);

        if let Err(e) = self.flush().await {
            if result.is_ok() {
                result = Err(e);
            } else {
                warn!(error = %e, "Final checkpoint failed");
            }
        }

        if let Some(mut handle) = cursor.take() {
            handle.close().await;
        }

        if let Err(e) = self.handler.close().await {
            warn!(handler = %self.handler.name(), error = %e, "Handler close failed");
        }

        let stats = {
            let mut stats = self.stats.write().await;
            if let Err(e) = &result {
                stats.last_error = Some(e.to_string());
            }
            stats.clone()
        };

        match &result {
            Ok(()) => info!(
                events_delivered = stats.events_delivered,
                events_filtered = stats.events_filtered,
                checkpoints = stats.checkpoints,
                "Subscription stopped"
            ),
            Err(e) => error!(error = %e, "Subscription stopped with error"),
        }

        self.set_state(ConsumerState::Stopped);
        result
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "State change");
        }
        metrics::set_subscription_status(&self.subscriber_id, state);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// The subscriber lock is refreshed while sleeping, so a long backoff or
    /// a wait for a missing source never outlives the lease. Returns false if
    /// interrupted.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> Result<bool, ConsumerError> {
        let deadline = Instant::now() + duration;
        loop {
            if self.shutdown_requested() {
                return Ok(false);
            }
            self.housekeeping().await?;

            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }
            let step = match &self.lock {
                Some(lock) => (deadline - now).min(lock.lease.ttl / 3),
                None => deadline - now,
            };
            tokio::select! {
                () = tokio::time::sleep(step) => {}
                _ = self.shutdown_rx.changed() => return Ok(false),
            }
        }
    }

    async fn load_position(&mut self) -> Result<(), ConsumerError> {
        if !self.config.persistent {
            return Ok(());
        }

        let Some(position) = self
            .store
            .load(&self.subscriber_id)
            .await
            .map_err(ConsumerError::StoreUnavailable)?
        else {
            info!(start_from = ?self.config.start_from, "No stored position");
            return Ok(());
        };

        let expected_kind = match (&position.last_value, self.config.consumer_type) {
            (SourcePosition::Value(_), ConsumerType::Tailable)
            | (SourcePosition::ResumeToken(_), ConsumerType::ChangeStreams) => true,
            _ => false,
        };
        if !expected_kind {
            return Err(ConfigError::Invalid(format!(
                "stored position for '{}' does not match consumer type {}",
                self.subscriber_id, self.config.consumer_type
            ))
            .into());
        }

        if position.tracking_field.is_some() && position.tracking_field != self.config.tracking_field
        {
            warn!(
                stored = ?position.tracking_field,
                configured = ?self.config.tracking_field,
                "Stored position was tracked on a different field"
            );
        }

        info!(last_value = %position.last_value, "Resuming from stored position");
        self.stats.write().await.last_position = Some(position.last_value.clone());
        self.position = Some(position);
        Ok(())
    }

    fn open_from(&self) -> OpenFrom {
        match &self.position {
            Some(position) => OpenFrom::After(position.last_value.clone()),
            None => match self.config.start_from {
                StartFrom::Beginning => OpenFrom::Beginning,
                StartFrom::Now => OpenFrom::Now,
            },
        }
    }

    /// Opens the source, retrying missing or unreachable sources until the
    /// open timeout elapses.
    ///
    /// Returns `None` if shutdown was requested while waiting.
    async fn open_with_retry(&mut self) -> Result<Option<Box<dyn CursorHandle>>, ConsumerError> {
        let deadline = Instant::now() + self.config.open_timeout;
        let from = self.open_from();
        let mut attempt = 0_u32;

        loop {
            if self.shutdown_requested() {
                return Ok(None);
            }

            match self.source.open(&from).await {
                Ok(handle) => {
                    debug!(source = %self.source.name(), ?from, "Cursor opened");
                    return Ok(Some(handle));
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let now = Instant::now();
                    if now >= deadline {
                        error!(attempts = attempt, error = %e, "Source unavailable");
                        return Err(ConsumerError::SourceUnavailable(e));
                    }

                    let backoff = self.config.backoff.calculate_backoff(attempt).min(deadline - now);
                    match &e {
                        SourceError::NotFound { .. } => debug!(
                            attempt,
                            backoff_ms = backoff.as_millis(),
                            "Source does not exist yet, waiting"
                        ),
                        _ => warn!(
                            attempt,
                            backoff_ms = backoff.as_millis(),
                            error = %e,
                            "Failed to open source, retrying"
                        ),
                    }

                    if !self.sleep_or_shutdown(backoff).await? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(ConsumerError::Source(e)),
            }
        }
    }

    async fn consume(
        &mut self,
        cursor: &mut Option<Box<dyn CursorHandle>>,
    ) -> Result<(), ConsumerError> {
        loop {
            if self.shutdown_requested() {
                debug!("Shutdown requested");
                return Ok(());
            }

            if cursor.is_none() {
                match self.open_with_retry().await? {
                    Some(handle) => *cursor = Some(handle),
                    None => return Ok(()),
                }
                self.set_state(ConsumerState::Running);
            }
            let Some(handle) = cursor.as_mut() else {
                continue;
            };

            match handle.next(self.config.poll_timeout).await {
                Ok(Next::Event(event)) => {
                    self.failures = 0;
                    // No delivery without a live lease.
                    self.housekeeping().await?;
                    self.on_event(event).await?;
                }
                Ok(Next::Timeout) => {
                    self.failures = 0;
                    trace!("Poll timeout");
                    self.checkpoint().await;
                    self.housekeeping().await?;
                }
                Ok(Next::Closed) => {
                    // A dead cursor (e.g. tailing an empty capped collection)
                    // is expected and does not count against the budget.
                    debug!("Cursor closed, reopening");
                    self.set_state(ConsumerState::Error);
                    if let Some(mut stale) = cursor.take() {
                        stale.close().await;
                    }
                    self.record_reconnect("closed").await;
                    let backoff = self.config.backoff.calculate_backoff(1);
                    if !self.sleep_or_shutdown(backoff).await? {
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.set_state(ConsumerState::Error);
                    if let Some(mut stale) = cursor.take() {
                        stale.close().await;
                    }

                    if !e.is_retryable() {
                        error!(error = %e, category = e.category(), "Non-retryable source error");
                        return Err(ConsumerError::Source(e));
                    }

                    self.failures += 1;
                    if self.config.backoff.exhausted(self.failures) {
                        error!(
                            attempts = self.failures,
                            error = %e,
                            "Max reconnection attempts exceeded"
                        );
                        return Err(ConsumerError::ReconnectLimitExceeded {
                            attempts: self.config.backoff.max_reconnect_attempts,
                            source: e,
                        });
                    }

                    let backoff = self.config.backoff.calculate_backoff(self.failures);
                    warn!(
                        attempt = self.failures,
                        backoff_ms = backoff.as_millis(),
                        error = %e,
                        "Cursor failed, reconnecting"
                    );
                    self.record_reconnect(e.category()).await;
                    if !self.sleep_or_shutdown(backoff).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn record_reconnect(&mut self, reason: &'static str) {
        self.stats.write().await.reconnects += 1;
        metrics::increment_reconnects(&self.subscriber_id, reason);
    }

    async fn on_event(&mut self, event: Event) -> Result<(), ConsumerError> {
        let matched = self
            .config
            .filter
            .as_ref()
            .map_or(true, |filter| filter.matches(&event));

        if !matched {
            trace!(position = %event.source_position, "Event filtered out");
            self.advance(&event.source_position).await;
            self.stats.write().await.events_filtered += 1;
            metrics::increment_events_filtered(&self.subscriber_id);
            return Ok(());
        }

        let result = {
            let subscriber = self.subscriber_id.clone();
            let _timer = metrics::Timer::new(subscriber, |duration, label| {
                metrics::record_handler_duration(duration, label);
            });
            self.handler.handle(&event).await
        };

        match result {
            Ok(()) => {
                trace!(
                    position = %event.source_position,
                    operation = event.operation_label(),
                    "Event delivered"
                );
                self.stats.write().await.events_delivered += 1;
                metrics::increment_events_delivered(&self.subscriber_id, event.operation_label());
                self.advance(&event.source_position).await;
                self.checkpoint().await;
                Ok(())
            }
            Err(e) => {
                self.stats.write().await.handler_failures += 1;
                match self.config.handler_failure_policy {
                    HandlerFailurePolicy::Stop => {
                        metrics::increment_handler_failures(&self.subscriber_id, "stop");
                        error!(
                            handler = %self.handler.name(),
                            position = %event.source_position,
                            error = %e,
                            "Handler failed, stopping subscription"
                        );
                        Err(ConsumerError::HandlerFailure {
                            subscriber_id: self.subscriber_id.clone(),
                            source: e,
                        })
                    }
                    HandlerFailurePolicy::Skip => {
                        metrics::increment_handler_failures(&self.subscriber_id, "skip");
                        warn!(
                            handler = %self.handler.name(),
                            position = %event.source_position,
                            error = %e,
                            "Handler failed, skipping event"
                        );
                        self.advance(&event.source_position).await;
                        self.checkpoint().await;
                        Ok(())
                    }
                }
            }
        }
    }

    async fn advance(&mut self, value: &SourcePosition) {
        let changed = match self.position.as_mut() {
            Some(position) => position.advance(value),
            None => {
                self.position = Some(Position::new(
                    self.subscriber_id.clone(),
                    self.config.tracking_field.clone(),
                    value.clone(),
                ));
                true
            }
        };

        if changed {
            self.dirty = true;
            self.stats.write().await.last_position = Some(value.clone());
        }
    }

    /// Saves the position if it moved. Failures defer the checkpoint.
    async fn checkpoint(&mut self) {
        if !self.config.persistent || !self.dirty {
            return;
        }
        if self
            .retry_checkpoint_at
            .is_some_and(|at| Instant::now() < at)
        {
            return;
        }

        match self.save().await {
            Ok(()) => {
                if self.checkpoint_failures > 0 {
                    info!(
                        deferred = self.checkpoint_failures,
                        "Checkpoint succeeded after failures"
                    );
                }
                self.checkpoint_failures = 0;
                self.retry_checkpoint_at = None;
            }
            Err(e) => {
                self.checkpoint_failures += 1;
                let delay = self
                    .config
                    .backoff
                    .calculate_backoff(self.checkpoint_failures);
                self.retry_checkpoint_at = Some(Instant::now() + delay);
                self.stats.write().await.checkpoint_failures += 1;
                metrics::increment_checkpoint_failures(&self.subscriber_id, e.category());
                warn!(
                    error = %e,
                    consecutive_failures = self.checkpoint_failures,
                    retry_in_ms = delay.as_millis(),
                    "Checkpoint failed, deferring"
                );
            }
        }
    }

    /// Writes the final checkpoint, ignoring any deferral.
    async fn flush(&mut self) -> Result<(), ConsumerError> {
        if !self.config.persistent || !self.dirty {
            return Ok(());
        }
        self.save().await.map_err(|e| {
            metrics::increment_checkpoint_failures(&self.subscriber_id, e.category());
            ConsumerError::StoreUnavailable(e)
        })
    }

    async fn save(&mut self) -> Result<(), StoreError> {
        let Some(position) = self.position.as_ref() else {
            return Ok(());
        };
        self.store.save(position).await?;

        self.dirty = false;
        self.stats.write().await.checkpoints += 1;
        metrics::increment_checkpoints(&self.subscriber_id);
        trace!(last_value = %position.last_value, "Checkpoint saved");
        Ok(())
    }

    /// Refreshes the subscriber lock once a third of its TTL has passed.
    async fn housekeeping(&mut self) -> Result<(), ConsumerError> {
        let Some(lock) = self.lock.as_mut() else {
            return Ok(());
        };
        let elapsed = lock.refreshed_at.elapsed();
        if elapsed < lock.lease.ttl / 3 {
            return Ok(());
        }

        match self
            .store
            .refresh_lock(&lock.lease.key, &lock.lease.owner_id, lock.lease.ttl)
            .await
        {
            Ok(true) => {
                lock.refreshed_at = Instant::now();
                metrics::increment_lock_refreshes();
                trace!(key = %lock.lease.key, "Lock refreshed");
                Ok(())
            }
            Ok(false) => {
                metrics::increment_locks_lost();
                error!(key = %lock.lease.key, "Subscriber lock lost");
                Err(ConsumerError::LockLost(self.subscriber_id.clone()))
            }
            Err(e) if elapsed < lock.lease.ttl => {
                warn!(key = %lock.lease.key, error = %e, "Lock refresh failed, will retry");
                Ok(())
            }
            Err(e) => {
                metrics::increment_locks_lost();
                error!(key = %lock.lease.key, error = %e, "Subscriber lock expired");
                Err(ConsumerError::LockLost(self.subscriber_id.clone()))
            }
        }
    }
}
