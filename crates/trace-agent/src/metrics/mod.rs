// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windowed metrics aggregators and the timer loop that ships them.
//!
//! Every aggregator follows the same cycle: ingest continuously, swap its
//! state out under a short lock when the flush timer fires, compute the
//! window's statistics outside the lock and hand the snapshot to the
//! collector. A failed send drops that window.

pub mod apm;
pub mod edge;
pub mod rpm;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::collector::{CollectorApi, CollectorError};

/// Median and 95th percentile of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub median: i64,
    #[serde(rename = "ninetyFive")]
    pub ninety_five: i64,
}

/// Nearest-rank median and 95th percentile: `sorted[round(n * q) - 1]`, no interpolation.
///
/// Sorts `samples` in place. Returns `None` for an empty window.
pub fn nearest_rank(samples: &mut [i64]) -> Option<Percentiles> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();

    let rank = |quantile: f64| {
        let position = (samples.len() as f64 * quantile).round() as usize;
        samples[position.saturating_sub(1).min(samples.len() - 1)]
    };

    Some(Percentiles {
        median: rank(0.5),
        ninety_five: rank(0.95),
    })
}

/// An aggregator that can ship its current window to the collector.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Swaps out the current window and sends it. Empty windows may be skipped.
    async fn flush_to(&self, api: &CollectorApi) -> Result<(), CollectorError>;
}

/// Drives one [`MetricsSource`] on a fixed interval until cancelled.
#[derive(Clone)]
pub struct MetricsFlusher {
    source: Arc<dyn MetricsSource>,
    api: CollectorApi,
    interval: Duration,
}

impl MetricsFlusher {
    pub fn new(source: Arc<dyn MetricsSource>, api: CollectorApi, interval: Duration) -> Self {
        MetricsFlusher {
            source,
            api,
            interval,
        }
    }

    /// Flushes the source once, logging instead of propagating failures.
    pub async fn flush(&self) {
        let name = self.source.name();
        match self.source.flush_to(&self.api).await {
            Ok(()) => debug!("{name} | flushed metrics window"),
            Err(e) => error!("{name} | dropping metrics window: {e}"),
        }
    }

    pub async fn start(&self, cancel: CancellationToken) {
        let mut flush_interval = interval(self.interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{} | flusher stopped", self.source.name());
                    break;
                }
                _ = flush_interval.tick() => {
                    // each window is an owned snapshot, so a slow send never blocks the next tick
                    let flusher = self.clone();
                    tokio::spawn(async move { flusher.flush().await });
                }
            }
        }
    }
}
