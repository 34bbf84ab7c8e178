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

//! Tail an in-memory capped log end to end.
//!
//! A producer appends documents with an increasing `seq` field while a
//! subscription prints them. Halfway through, the subscription is restarted
//! and resumes right after the last printed document.
//!
//! ```bash
//! RUST_LOG=tailtrack_core=debug cargo run -p tailtrack-stores --example memory_tail
//! ```
//!
//! With `--features metrics-export`, metrics are served at
//! `http://localhost:9000/metrics`.

use bson::doc;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tailtrack_core::handler::{FnHandler, HandlerError};
use tailtrack_core::source::MemoryLog;
use tailtrack_core::{metrics, ConsumerState, Event, LifecycleController, SubscriptionConfig};
use tailtrack_stores::memory::MemoryStore;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const SUBSCRIBER: &str = "memory-demo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    metrics::init_metrics();
    #[cfg(feature = "metrics-export")]
    install_exporter()?;

    let log = MemoryLog::new("events");
    let store = MemoryStore::new();
    let controller = LifecycleController::new(Arc::new(store.clone()));

    let config = SubscriptionConfig::builder()
        .collection("events")
        .tracking_field("seq")
        .persistent(true)
        .persistent_id(SUBSCRIBER)
        .stream_filter(r#"{"level": {"$ne": "debug"}}"#)
        .poll_timeout(Duration::from_millis(250))
        .build()?;

    let producer = {
        let log = log.clone();
        tokio::spawn(async move {
            for seq in 1..=20_i64 {
                let level = if seq % 4 == 0 { "debug" } else { "info" };
                log.insert(doc! { "seq": seq, "level": level, "message": format!("event {seq}") })
                    .await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
    };

    controller
        .start(config, Arc::new(log.tailable("seq")), Box::new(printer("first")))
        .await?;
    controller
        .wait_for_state(SUBSCRIBER, ConsumerState::Running, Duration::from_secs(5))
        .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("Restarting subscription");
    controller
        .restart(SUBSCRIBER, Arc::new(log.tailable("seq")), Box::new(printer("second")))
        .await?;

    producer.await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    for (id, result) in controller.stop_all().await {
        let stats = result?;
        info!(
            subscriber = %id,
            delivered = stats.events_delivered,
            filtered = stats.events_filtered,
            checkpoints = stats.checkpoints,
            "Subscription finished"
        );
    }

    if let Some(position) = tailtrack_core::PositionStore::load(&store, SUBSCRIBER).await? {
        info!(last_value = %position.last_value, "Stored position");
    }
    Ok(())
}

fn printer(run: &'static str) -> FnHandler<impl FnMut(&Event) -> Result<(), HandlerError> + Send> {
    FnHandler::new(run, move |event: &Event| {
        info!(
            run,
            position = %event.source_position,
            text = event.payload.get_str("message").unwrap_or_default(),
            "Received"
        );
        Ok(())
    })
}

fn init_logging() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[cfg(feature = "metrics-export")]
fn install_exporter() -> Result<(), Box<dyn Error>> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    let addr: SocketAddr = ([0, 0, 0, 0], 9000).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}
