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

//! Tailtrack Core - ordered log tailing with durable checkpointing
//!
//! This crate reads an ordered, append-only MongoDB source (a tailable cursor
//! over a capped collection, or a change stream), delivers each event to a
//! handler in order and persists how far it got, so a restarted subscriber
//! resumes exactly after the last delivered event.
//!
//! # Key Components
//!
//! - **Sources**: [`source`] defines the [`CursorSource`] contract and its
//!   tailable, change stream and in-memory implementations
//! - **Positions**: [`position`] and the [`PositionStore`] trait in [`state`]
//! - **Filters**: [`filter`] applies `$match`-style predicates before delivery
//! - **Consumer**: [`consumer`] runs the per-subscription loop
//! - **Controller**: [`controller`] starts, stops and reports on subscriptions
//!
//! # Example
//!
//! ```rust
//! use bson::doc;
//! use tailtrack_core::event::{Event, SourcePosition};
//!
//! let event = Event::tailed(doc! { "increasing": 7 }, "increasing").unwrap();
//! assert_eq!(event.source_position, SourcePosition::Value(7.into()));
//! ```

pub mod config;
pub mod consumer;
pub mod controller;
pub mod event;
pub mod filter;
pub mod handler;
pub mod metrics;
pub mod position;
pub mod source;
pub mod state;

pub use config::{ConsumerType, StartFrom, SubscriptionConfig};
pub use consumer::{ConsumerError, ConsumerState, ConsumerStats, TailConsumer};
pub use controller::LifecycleController;
pub use event::{Event, OperationType, SourcePosition};
pub use handler::{EventHandler, HandlerError};
pub use position::Position;
pub use source::{CursorHandle, CursorSource, Next, OpenFrom, SourceError};
pub use state::{PositionStore, StoreError};
