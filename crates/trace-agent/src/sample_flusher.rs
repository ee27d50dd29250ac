// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::agent::Sample;
use crate::agent_service::AgentHandle;
use crate::collector::CollectorApi;

/// Periodically closes the agent's sampling interval and ships it.
#[derive(Clone)]
pub struct SampleFlusher {
    handle: AgentHandle,
    api: CollectorApi,
    interval: Duration,
}

impl SampleFlusher {
    pub fn new(handle: AgentHandle, api: CollectorApi, interval: Duration) -> Self {
        SampleFlusher {
            handle,
            api,
            interval,
        }
    }

    /// Closes the current interval and sends it. Send failures drop the interval.
    ///
    /// Returns the shipped sample, or `None` when nothing was sent.
    pub async fn flush(&self) -> Option<Sample> {
        let payload = match self.handle.flush().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to flush agent: {e}");
                return None;
            }
        };

        let n_spans = payload.spans.len();
        debug!(
            "Flushing {n_spans} spans, sample rate {} over {} requests",
            payload.sample.rate, payload.sample.total_request_count
        );

        match self.api.send_samples(&payload).await {
            Ok(()) => {
                debug!("Successfully flushed {n_spans} spans");
                Some(payload.sample)
            }
            Err(e) => {
                error!("Failed to send samples, dropping {n_spans} spans: {e}");
                None
            }
        }
    }

    pub async fn start(&self, cancel: CancellationToken) {
        let mut flush_interval = interval(self.interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Sample flusher stopped");
                    break;
                }
                _ = flush_interval.tick() => {
                    let flusher = self.clone();
                    tokio::spawn(async move { flusher.flush().await });
                }
            }
        }
    }
}
