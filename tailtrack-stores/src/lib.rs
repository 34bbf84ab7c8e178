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

//! Position store implementations for tailtrack.
//!
//! This crate provides backends for the
//! [`PositionStore`](tailtrack_core::state::PositionStore) trait.
//!
//! # Available Stores
//!
//! - **Memory** (`memory` feature): process-local, lost on restart
//! - **File** (`file` feature): one JSON file, durable across restarts
//! - **MongoDB** (`mongo` feature): tracking documents next to the source
//! - **Redis** (`redis-store` feature): shared state for multi-instance
//!   deployments
//!
//! The memory, MongoDB and Redis stores implement subscriber locks, so a
//! [`LifecycleController`](tailtrack_core::LifecycleController) refuses to
//! start a subscriber another instance already runs.
//!
//! # Example: File Store
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tailtrack_core::LifecycleController;
//! use tailtrack_stores::file::FileStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::open("/var/lib/tailtrack/positions.json").await?;
//! let controller = LifecycleController::new(Arc::new(store));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

#[cfg(feature = "file")]
pub mod file;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "mongo")]
pub mod mongo;
#[cfg(feature = "redis-store")]
pub mod redis;
