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

//! Lifecycle controller.
//!
//! The controller is the registry of running subscriptions. It enforces one
//! loop per subscriber id, takes the subscriber lock in the shared position
//! store for persistent subscriptions (so two processes pointed at the same
//! store cannot tail the same subscriber) and releases it on stop.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tailtrack_core::config::SubscriptionConfig;
//! use tailtrack_core::controller::LifecycleController;
//! use tailtrack_core::handler::CollectingHandler;
//! use tailtrack_core::source::MemoryLog;
//! # use tailtrack_core::state::PositionStore;
//!
//! # async fn example(store: Arc<dyn PositionStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let controller = LifecycleController::new(store);
//! let log = MemoryLog::new("capped");
//!
//! let config = SubscriptionConfig::builder()
//!     .collection("capped")
//!     .tracking_field("increasing")
//!     .persistent(true)
//!     .persistent_id("darwin")
//!     .build()?;
//!
//! controller
//!     .start(config, Arc::new(log.tailable("increasing")), Box::new(CollectingHandler::new()))
//!     .await?;
//!
//! // ...
//!
//! let stats = controller.stop("darwin").await?;
//! println!("delivered {}", stats.events_delivered);
//! # Ok(())
//! # }
//! ```

use crate::config::SubscriptionConfig;
use crate::consumer::{ConsumerError, ConsumerState, ConsumerStats, LockLease, TailConsumer};
use crate::handler::EventHandler;
use crate::metrics::{self, LockFailureReason};
use crate::source::CursorSource;
use crate::state::{lock_key, PositionStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

struct Subscription {
    config: SubscriptionConfig,
    consumer: TailConsumer,
    lease: Option<LockLease>,
}

/// Starts, stops and reports on subscriptions.
pub struct LifecycleController {
    store: Arc<dyn PositionStore>,
    owner_id: String,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl LifecycleController {
    /// Creates a controller with a random owner id (`tailtrack-<uuid>`).
    #[must_use]
    pub fn new(store: Arc<dyn PositionStore>) -> Self {
        Self::with_owner_id(store, format!("tailtrack-{}", uuid::Uuid::new_v4()))
    }

    /// Creates a controller with an explicit owner id for subscriber locks.
    #[must_use]
    pub fn with_owner_id(store: Arc<dyn PositionStore>, owner_id: impl Into<String>) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Identity used when taking subscriber locks.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// The shared position store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    /// Starts a subscription.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::AlreadyRunning`] if the subscriber id is active
    /// - [`ConsumerError::LockHeld`] if another instance holds its lock
    /// - [`ConsumerError::StoreUnavailable`] if the lock cannot be taken
    /// - [`ConsumerError::Configuration`] if the configuration is invalid or
    ///   `source` does not match it
    #[instrument(skip_all, fields(subscriber = %config.subscriber_id()))]
    pub async fn start(
        &self,
        config: SubscriptionConfig,
        source: Arc<dyn CursorSource>,
        handler: Box<dyn EventHandler>,
    ) -> Result<(), ConsumerError> {
        config.validate()?;
        config.check_source(source.as_ref())?;
        let subscriber_id = config.subscriber_id().to_string();
        let mut subscriptions = self.subscriptions.lock().await;

        if let Some(existing) = subscriptions.get(&subscriber_id) {
            if !existing.consumer.is_finished() {
                return Err(ConsumerError::AlreadyRunning(subscriber_id));
            }
        }
        if let Some(finished) = subscriptions.remove(&subscriber_id) {
            // Reap a subscription that stopped on its own.
            let result = self.shutdown(finished).await;
            debug!(ok = result.is_ok(), "Reaped finished subscription");
        }

        let lease = if config.persistent {
            Some(self.acquire_lock(&subscriber_id, config.lock_ttl).await?)
        } else {
            None
        };

        let consumer = TailConsumer::spawn(
            config.clone(),
            source,
            Arc::clone(&self.store),
            handler,
            lease.clone(),
        );

        subscriptions.insert(
            subscriber_id,
            Subscription {
                config,
                consumer,
                lease,
            },
        );
        metrics::set_active_subscriptions(subscriptions.len());
        info!("Subscription started");
        Ok(())
    }

    /// Stops a subscription and waits for its loop to finish.
    ///
    /// Returns the final statistics.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::NotFound`] for unknown ids, or the error
    /// that stopped the loop.
    #[instrument(skip(self))]
    pub async fn stop(&self, subscriber_id: &str) -> Result<ConsumerStats, ConsumerError> {
        let mut subscriptions = self.subscriptions.lock().await;
        let subscription = subscriptions
            .remove(subscriber_id)
            .ok_or_else(|| ConsumerError::NotFound(subscriber_id.to_string()))?;
        metrics::set_active_subscriptions(subscriptions.len());

        self.shutdown(subscription).await
    }

    /// Stops a subscription and starts it again with the same configuration.
    ///
    /// The new loop resumes from the position the old one persisted.
    ///
    /// # Errors
    ///
    /// Returns any error from [`stop`](Self::stop) except a handler or
    /// source failure of the old loop, which is logged, and any error from
    /// [`start`](Self::start).
    pub async fn restart(
        &self,
        subscriber_id: &str,
        source: Arc<dyn CursorSource>,
        handler: Box<dyn EventHandler>,
    ) -> Result<(), ConsumerError> {
        let config = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .get(subscriber_id)
                .map(|s| s.config.clone())
                .ok_or_else(|| ConsumerError::NotFound(subscriber_id.to_string()))?
        };
        config.check_source(source.as_ref())?;

        match self.stop(subscriber_id).await {
            Ok(_) => {}
            Err(e @ (ConsumerError::StoreUnavailable(_) | ConsumerError::NotFound(_))) => {
                return Err(e)
            }
            Err(e) => warn!(error = %e, "Previous run ended with error"),
        }

        self.start(config, source, handler).await
    }

    /// Current state of a subscription; unknown ids are `Stopped`.
    pub async fn status(&self, subscriber_id: &str) -> ConsumerState {
        self.subscriptions
            .lock()
            .await
            .get(subscriber_id)
            .map_or(ConsumerState::Stopped, |s| s.consumer.state())
    }

    /// Statistics of a registered subscription.
    pub async fn stats(&self, subscriber_id: &str) -> Option<ConsumerStats> {
        let subscriptions = self.subscriptions.lock().await;
        match subscriptions.get(subscriber_id) {
            Some(s) => Some(s.consumer.stats().await),
            None => None,
        }
    }

    /// Ids of all registered subscriptions, sorted.
    pub async fn subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Waits until a subscription reaches `state`.
    ///
    /// Returns false on timeout or for unknown ids.
    pub async fn wait_for_state(
        &self,
        subscriber_id: &str,
        state: ConsumerState,
        timeout: Duration,
    ) -> bool {
        let receiver = {
            let subscriptions = self.subscriptions.lock().await;
            match subscriptions.get(subscriber_id) {
                Some(s) => s.consumer.subscribe_state(),
                None => return false,
            }
        };

        let mut receiver = receiver;
        let result = tokio::time::timeout(timeout, receiver.wait_for(|s| *s == state)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Stops every subscription.
    ///
    /// Returns each subscriber id with its result.
    pub async fn stop_all(&self) -> Vec<(String, Result<ConsumerStats, ConsumerError>)> {
        let mut subscriptions = self.subscriptions.lock().await;
        let mut ids: Vec<String> = subscriptions.keys().cloned().collect();
        ids.sort();

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(subscription) = subscriptions.remove(&id) {
                let result = self.shutdown(subscription).await;
                results.push((id, result));
            }
        }
        metrics::set_active_subscriptions(0);
        results
    }

    async fn acquire_lock(&self, subscriber_id: &str, ttl: Duration) -> Result<LockLease, ConsumerError> {
        let key = lock_key(subscriber_id);

        match self.store.try_acquire_lock(&key, &self.owner_id, ttl).await {
            Ok(true) => {
                metrics::increment_lock_acquisitions();
                debug!(%key, owner = %self.owner_id, "Subscriber lock acquired");
                Ok(LockLease {
                    key,
                    owner_id: self.owner_id.clone(),
                    ttl,
                })
            }
            Ok(false) => {
                metrics::increment_lock_acquisition_failures(LockFailureReason::AlreadyHeld);
                warn!(%key, "Subscriber lock held by another instance");
                Err(ConsumerError::LockHeld(subscriber_id.to_string()))
            }
            Err(e) => {
                metrics::increment_lock_acquisition_failures(LockFailureReason::Error);
                Err(ConsumerError::StoreUnavailable(e))
            }
        }
    }

    async fn shutdown(&self, mut subscription: Subscription) -> Result<ConsumerStats, ConsumerError> {
        let result = subscription.consumer.stop().await;

        if let Some(lease) = subscription.lease {
            match self.store.release_lock(&lease.key, &lease.owner_id).await {
                Ok(true) => {
                    metrics::increment_locks_released();
                    debug!(key = %lease.key, "Subscriber lock released");
                }
                Ok(false) => warn!(key = %lease.key, "Subscriber lock was no longer held"),
                Err(e) => warn!(key = %lease.key, error = %e, "Failed to release subscriber lock"),
            }
        }

        result
    }
}
