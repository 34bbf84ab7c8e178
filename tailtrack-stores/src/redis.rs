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

//! Redis-backed position store for distributed deployments.
//!
//! Positions are stored as BSON-encoded tracking documents under
//! `tailtrack:position:{subscriber_id}`, so every BSON type a tracking field
//! can hold survives the round trip. Subscriber locks are plain keys
//! (`tailtrack:lock:{subscriber_id}`) holding the owner id, taken with
//! `SET NX PX` and refreshed or released only by their owner.
//!
//! # Features
//!
//! - **Connection Pooling**: Uses `deadpool-redis` for connection management
//! - **TTL Support**: Optional expiration for stored positions
//! - **Retry Logic**: Automatic retries on transient connection failures
//! - **Subscriber Locks**: At most one process tails a subscriber id
//!
//! # Example
//!
//! ```rust,no_run
//! use tailtrack_stores::redis::{RedisConfig, RedisStore};
//! use tailtrack_core::PositionStore;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(10)
//!     .ttl(Duration::from_secs(7 * 24 * 60 * 60))
//!     .build()?;
//!
//! let store = RedisStore::new(config).await?;
//! let position = store.load("orders-feed").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::Document;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tailtrack_core::position::fields;
use tailtrack_core::{Position, PositionStore, StoreError};
use tracing::{debug, error, warn};

/// Key prefix for stored positions.
const KEY_PREFIX: &str = "tailtrack:position";

/// Maximum number of retry attempts for transient Redis errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 100;

const REFRESH_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Configuration for [`RedisStore`].
///
/// ```rust
/// use tailtrack_stores::redis::RedisConfig;
/// use std::time::Duration;
///
/// let config = RedisConfig::builder()
///     .url("redis://localhost:6379")
///     .pool_size(15)
///     .ttl(Duration::from_secs(86400))
///     .build()
///     .expect("valid config");
/// ```
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Connection pool size (default: 10)
    pub pool_size: usize,

    /// Optional TTL for stored positions
    ///
    /// Positions of subscribers that stop checkpointing expire after this
    /// duration.
    pub ttl: Option<Duration>,

    /// Connection timeout (default: 5 seconds)
    pub connection_timeout: Duration,

    /// Maximum number of retries for transient errors (default: 3)
    pub max_retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            ttl: None,
            connection_timeout: Duration::from_secs(5),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RedisConfig {
    /// Creates a new builder for `RedisConfig`.
    #[must_use]
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }
}

/// Builder for [`RedisConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    pool_size: Option<usize>,
    ttl: Option<Duration>,
    connection_timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl RedisConfigBuilder {
    /// Creates a new `RedisConfigBuilder`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the Redis connection URL.
    ///
    /// # Formats
    ///
    /// - Standalone: `redis://localhost:6379`
    /// - With auth: `redis://:password@localhost:6379`
    /// - With database: `redis://localhost:6379/0`
    /// - TLS: `rediss://localhost:6380`
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the connection pool size.
    ///
    /// Default: 10
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the TTL for stored positions.
    ///
    /// If not set, positions never expire.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the connection timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of retries for transient errors.
    ///
    /// Default: 3
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the `RedisConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is missing or the pool size or TTL is 0.
    pub fn build(self) -> Result<RedisConfig, StoreError> {
        let url = self
            .url
            .ok_or_else(|| StoreError::Other("Redis URL is required".to_string()))?;

        let pool_size = self.pool_size.unwrap_or(10);
        if pool_size == 0 {
            return Err(StoreError::Other(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        if self.ttl.is_some_and(|ttl| ttl.as_secs() == 0) {
            return Err(StoreError::Other(
                "TTL must be at least one second".to_string(),
            ));
        }

        Ok(RedisConfig {
            url,
            pool_size,
            ttl: self.ttl,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(5)),
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
        })
    }
}

/// Redis-backed [`PositionStore`] with distributed subscriber locks.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    config: RedisConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis and verifies the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool cannot be created or
    /// Redis does not answer.
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        debug!(pool_size = config.pool_size, "Initializing Redis position store");

        let mut pool_config = PoolConfig::from_url(&config.url);
        if let Some(pool) = pool_config.pool.as_mut() {
            pool.max_size = config.pool_size;
            pool.timeouts.wait = Some(config.connection_timeout);
            pool.timeouts.create = Some(config.connection_timeout);
            pool.timeouts.recycle = Some(config.connection_timeout);
        }

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                error!(error = %e, "Failed to create Redis connection pool");
                StoreError::Connection(format!("Failed to create pool: {e}"))
            })?;

        let mut conn = pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get connection from pool");
            StoreError::Connection(format!("Failed to connect to Redis: {e}"))
        })?;

        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Redis PING failed");
                StoreError::Connection(format!("Redis connection test failed: {e}"))
            })?;

        debug!("Redis position store initialized");
        Ok(Self { pool, config })
    }

    fn make_key(subscriber_id: &str) -> String {
        format!("{KEY_PREFIX}:{subscriber_id}")
    }

    async fn connection(pool: &Pool) -> Result<deadpool_redis::Connection, RedisError> {
        pool.get().await.map_err(|e| {
            RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get connection from pool",
                e.to_string(),
            ))
        })
    }

    /// Executes a Redis operation with retry logic for transient errors.
    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::is_retryable(&e) && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    warn!(
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(retries, error = %e, "Redis operation failed");
                    return Err(StoreError::Connection(format!(
                        "Redis operation failed: {e}"
                    )));
                }
            }
        }
    }

    fn is_retryable(error: &RedisError) -> bool {
        matches!(
            error.kind(),
            redis::ErrorKind::IoError | redis::ErrorKind::ResponseError
        )
    }

    fn serialize_position(position: &Position) -> Result<Vec<u8>, StoreError> {
        bson::to_vec(&position.to_document(fields::LAST_VALUE)).map_err(|e| {
            StoreError::Serialization(format!("Failed to serialize position: {e}"))
        })
    }

    fn deserialize_position(bytes: &[u8]) -> Result<Position, StoreError> {
        let document: Document = bson::from_slice(bytes).map_err(|e| {
            StoreError::Serialization(format!("Failed to deserialize position: {e}"))
        })?;
        Position::from_document(&document, fields::LAST_VALUE).map_err(StoreError::Serialization)
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl PositionStore for RedisStore {
    async fn load(&self, subscriber_id: &str) -> Result<Option<Position>, StoreError> {
        let key = Self::make_key(subscriber_id);
        let pool = self.pool.clone();

        let bytes: Option<Vec<u8>> = self
            .with_retry(|| async {
                let mut conn = Self::connection(&pool).await?;
                conn.get(&key).await
            })
            .await?;

        match bytes {
            Some(data) => {
                debug!(subscriber = subscriber_id, "Loaded position from Redis");
                Ok(Some(Self::deserialize_position(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, position: &Position) -> Result<(), StoreError> {
        let key = Self::make_key(&position.subscriber_id);
        let value = Self::serialize_position(position)?;
        let pool = self.pool.clone();
        let ttl = self.config.ttl;

        self.with_retry::<_, (), _>(|| async {
            let mut conn = Self::connection(&pool).await?;
            match ttl {
                Some(ttl) => conn.set_ex(&key, &value, ttl.as_secs()).await,
                None => conn.set(&key, &value).await,
            }
        })
        .await
    }

    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError> {
        let key = Self::make_key(subscriber_id);
        let pool = self.pool.clone();

        self.with_retry::<_, (), _>(|| async {
            let mut conn = Self::connection(&pool).await?;
            conn.del(&key).await
        })
        .await?;

        debug!(subscriber = subscriber_id, "Deleted position from Redis");
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, Position>, StoreError> {
        let pattern = format!("{KEY_PREFIX}:*");
        let pool = self.pool.clone();

        let keys: Vec<String> = self
            .with_retry(|| async {
                let mut conn = Self::connection(&pool).await?;
                redis::cmd("KEYS").arg(&pattern).query_async(&mut *conn).await
            })
            .await?;

        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let values: Vec<Option<Vec<u8>>> = self
            .with_retry(|| async {
                let mut conn = Self::connection(&pool).await?;
                redis::cmd("MGET").arg(&keys).query_async(&mut *conn).await
            })
            .await?;

        let mut result = HashMap::new();
        for value in values.into_iter().flatten() {
            let position = Self::deserialize_position(&value)?;
            result.insert(position.subscriber_id.clone(), position);
        }

        debug!(count = result.len(), "Listed positions from Redis");
        Ok(result)
    }

    async fn close(&self) -> Result<(), StoreError> {
        debug!("Closing Redis position store");
        self.pool.close();
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let ttl_ms = Self::ttl_millis(ttl);

        let set: Option<String> = self
            .with_retry(|| async {
                let mut conn = Self::connection(&pool).await?;
                redis::cmd("SET")
                    .arg(key)
                    .arg(owner_id)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut *conn)
                    .await
            })
            .await?;

        if set.is_some() {
            debug!(key, owner = owner_id, "Lock acquired");
            return Ok(true);
        }

        // Re-entrant for the current owner.
        self.refresh_lock(key, owner_id, ttl).await
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let ttl_ms = Self::ttl_millis(ttl);
        let script = redis::Script::new(REFRESH_SCRIPT);

        let refreshed: i64 = self
            .with_retry(|| async {
                let mut conn = Self::connection(&pool).await?;
                script
                    .key(key)
                    .arg(owner_id)
                    .arg(ttl_ms)
                    .invoke_async(&mut *conn)
                    .await
            })
            .await?;

        Ok(refreshed == 1)
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);

        let released: i64 = self
            .with_retry(|| async {
                let mut conn = Self::connection(&pool).await?;
                script.key(key).arg(owner_id).invoke_async(&mut *conn).await
            })
            .await?;

        if released == 1 {
            debug!(key, owner = owner_id, "Lock released");
        }
        Ok(released == 1)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        self.with_retry(|| async {
            let mut conn = Self::connection(&pool).await?;
            conn.exists(key).await
        })
        .await
    }
}
