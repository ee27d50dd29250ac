// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scheduling lag of the tokio runtime, reported as event loop lag.
//!
//! Every tick sleeps for a fixed period and measures how late the wakeup
//! was. A busy or blocked runtime wakes the sampler late.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trace_agent::agent_service::AgentHandle;
use trace_agent::metrics::apm::ApmMetrics;
use trace_agent::proc::ProcfsProbe;

pub const LAG_SAMPLE_PERIOD: Duration = Duration::from_millis(500);

pub struct LagSampler {
    apm_metrics: Arc<ApmMetrics>,
    agent: AgentHandle,
    probe: ProcfsProbe,
    period: Duration,
}

impl LagSampler {
    pub fn new(apm_metrics: Arc<ApmMetrics>, agent: AgentHandle, probe: ProcfsProbe) -> Self {
        LagSampler {
            apm_metrics,
            agent,
            probe,
            period: LAG_SAMPLE_PERIOD,
        }
    }

    /// Sleeps one period and records how late the wakeup was, in milliseconds.
    pub async fn sample(&self) -> u64 {
        let start = Instant::now();
        tokio::time::sleep(self.period).await;
        let lag = start.elapsed().saturating_sub(self.period).as_millis() as u64;
        self.apm_metrics.record_event_loop_lag(lag);

        // open transactions are the in-flight requests
        let requests = match self.agent.stats().await {
            Ok(stats) => stats.partial_spans as u64,
            Err(e) => {
                debug!("Could not read agent stats: {e}");
                0
            }
        };
        self.apm_metrics
            .set_active_counts(requests, self.probe.open_handles());
        lag
    }

    pub async fn start(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Lag sampler stopped");
                    break;
                }
                _ = self.sample() => {}
            }
        }
    }
}
