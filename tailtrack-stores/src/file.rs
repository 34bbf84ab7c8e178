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

//! File-backed position store.
//!
//! All positions live in one JSON file keyed by subscriber id. Each value is
//! the position's tracking document in canonical extended JSON, so BSON
//! types (`Int64`, `ObjectId`, dates, resume tokens) survive a round trip.
//!
//! Every save rewrites the whole file through a temporary sibling and a
//! rename, so a crash leaves either the old or the new file in place.
//!
//! ```json
//! {
//!   "orders-feed": {
//!     "persistentId": "orders-feed",
//!     "trackingField": "seq",
//!     "lastTrackingValue": { "$numberLong": "42" },
//!     "updatedAt": { "$date": { "$numberLong": "1767225600000" } }
//!   }
//! }
//! ```

use bson::{Bson, Document};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tailtrack_core::position::fields;
use tailtrack_core::{Position, PositionStore, StoreError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace};

/// Durable single-process [`PositionStore`] in a JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    positions: Mutex<HashMap<String, Position>>,
}

impl FileStore {
    /// Opens the store at `path`, reading existing positions.
    ///
    /// A missing or empty file is an empty store; the file and its parent
    /// directory are created on the first save.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read and
    /// [`StoreError::Serialization`] if it is corrupt.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let positions = read_positions(&path).await?;
        info!(positions = positions.len(), "Opened file position store");

        Ok(Self {
            path,
            positions: Mutex::new(positions),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, positions: &HashMap<String, Position>) -> Result<(), StoreError> {
        let mut root = serde_json::Map::with_capacity(positions.len());
        for (id, position) in positions {
            let document = position.to_document(fields::LAST_VALUE);
            root.insert(id.clone(), Bson::Document(document).into_canonical_extjson());
        }
        let bytes = serde_json::to_vec_pretty(&serde_json::Value::Object(root))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;

        trace!(path = %self.path.display(), bytes = bytes.len(), "Position file written");
        Ok(())
    }
}

async fn read_positions(path: &Path) -> Result<HashMap<String, Position>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    if bytes.is_empty() {
        return Ok(HashMap::new());
    }

    let root: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;

    let mut positions = HashMap::with_capacity(root.len());
    for (id, value) in root {
        let document = match Bson::try_from(value) {
            Ok(Bson::Document(document)) => document,
            Ok(other) => {
                return Err(StoreError::Serialization(format!(
                    "position '{id}' is not a document: {other}"
                )))
            }
            Err(e) => {
                return Err(StoreError::Serialization(format!(
                    "position '{id}' is not valid extended JSON: {e}"
                )))
            }
        };
        positions.insert(id, decode(&document)?);
    }
    Ok(positions)
}

fn decode(document: &Document) -> Result<Position, StoreError> {
    Position::from_document(document, fields::LAST_VALUE).map_err(StoreError::Serialization)
}

#[async_trait::async_trait]
impl PositionStore for FileStore {
    async fn load(&self, subscriber_id: &str) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.lock().await.get(subscriber_id).cloned())
    }

    async fn save(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = self.positions.lock().await;
        let previous = positions.insert(position.subscriber_id.clone(), position.clone());

        if let Err(e) = self.persist(&positions).await {
            // Keep memory consistent with what is on disk.
            match previous {
                Some(previous) => positions.insert(position.subscriber_id.clone(), previous),
                None => positions.remove(&position.subscriber_id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError> {
        let mut positions = self.positions.lock().await;
        let Some(previous) = positions.remove(subscriber_id) else {
            return Ok(());
        };

        if let Err(e) = self.persist(&positions).await {
            positions.insert(subscriber_id.to_string(), previous);
            return Err(e);
        }
        debug!(subscriber = subscriber_id, "Deleted position from file");
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, Position>, StoreError> {
        Ok(self.positions.lock().await.clone())
    }
}
