// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::SpanAgent;
use crate::agent_service::{AgentHandle, AgentService};
use crate::collector::{CollectorApi, CollectorApiConfig};
use crate::config::Config;
use crate::error::ServicesError;
use crate::metrics::apm::{ApmMetrics, RuntimeProbe};
use crate::metrics::edge::EdgeMetrics;
use crate::metrics::rpm::RpmMetrics;
use crate::metrics::{MetricsFlusher, MetricsSource};
use crate::sample_flusher::SampleFlusher;

/// Wires the agent, the aggregators and their flush timers to one collector.
pub struct TraceAgent {
    config: Config,
    probe: Arc<dyn RuntimeProbe>,
}

impl TraceAgent {
    pub fn new(config: Config, probe: Arc<dyn RuntimeProbe>) -> Self {
        TraceAgent { config, probe }
    }

    /// Spawns the agent service and every flush loop on the current runtime.
    ///
    /// Service registration starts in the background right away so the first
    /// metrics flush usually finds the key already cached.
    pub fn start(self) -> Result<TraceAgentHandle, ServicesError> {
        let config = self.config;
        let api = CollectorApi::new(CollectorApiConfig::from(&config))?;

        let rpm_metrics = Arc::new(RpmMetrics::new());
        let apm_metrics = Arc::new(ApmMetrics::new(self.probe));
        let edge_metrics = Arc::new(EdgeMetrics::new());

        let agent = SpanAgent::new(config.initial_sample_rate, config.sample_size)
            .with_rpm_metrics(Arc::clone(&rpm_metrics));
        let (service, agent_handle) = AgentService::new(agent);
        let service_task = tokio::spawn(service.run());

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let sample_flusher =
            SampleFlusher::new(agent_handle.clone(), api.clone(), config.collect_interval);
        let flusher = sample_flusher.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { flusher.start(token).await }));

        let sources: [Arc<dyn MetricsSource>; 3] = [
            Arc::clone(&apm_metrics) as Arc<dyn MetricsSource>,
            Arc::clone(&rpm_metrics) as Arc<dyn MetricsSource>,
            Arc::clone(&edge_metrics) as Arc<dyn MetricsSource>,
        ];
        let metrics_flushers = sources
            .into_iter()
            .map(|source| MetricsFlusher::new(source, api.clone(), config.collect_interval))
            .collect::<Vec<_>>();
        for metrics_flusher in &metrics_flushers {
            let flusher = metrics_flusher.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { flusher.start(token).await }));
        }

        let registration = api.clone();
        tokio::spawn(async move {
            if let Err(e) = registration.get_service().await {
                error!("Service registration failed, retrying on next metrics flush: {e}");
            }
        });

        info!(
            "Trace agent started for service '{}', flushing every {} ms",
            config.service_name,
            config.collect_interval.as_millis()
        );

        Ok(TraceAgentHandle {
            agent: agent_handle,
            api,
            apm_metrics,
            edge_metrics,
            sample_flusher,
            metrics_flushers,
            cancel,
            service_task,
            tasks,
            shutdown_grace: config.shutdown_grace,
        })
    }
}

/// Handle to a running [`TraceAgent`].
pub struct TraceAgentHandle {
    agent: AgentHandle,
    api: CollectorApi,
    apm_metrics: Arc<ApmMetrics>,
    edge_metrics: Arc<EdgeMetrics>,
    sample_flusher: SampleFlusher,
    metrics_flushers: Vec<MetricsFlusher>,
    cancel: CancellationToken,
    service_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl TraceAgentHandle {
    pub fn agent(&self) -> AgentHandle {
        self.agent.clone()
    }

    pub fn apm_metrics(&self) -> Arc<ApmMetrics> {
        Arc::clone(&self.apm_metrics)
    }

    pub fn edge_metrics(&self) -> Arc<EdgeMetrics> {
        Arc::clone(&self.edge_metrics)
    }

    /// Cancelled when shutdown begins.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the flush timers, ships what is buffered and stops the agent service.
    ///
    /// The final flush and the service drain share one grace period. The agent
    /// service is stopped even when the grace period runs out.
    pub async fn shutdown(self) -> Result<(), ServicesError> {
        info!("Shutting down trace agent");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Flush loop exited abnormally: {e}");
            }
        }

        let api = self.api;
        let sample_flusher = self.sample_flusher;
        let metrics_flushers = self.metrics_flushers;
        let agent = self.agent;
        let drain_agent = agent.clone();
        let service_task = self.service_task;

        let drain = async move {
            debug!("Final flush of spans and metrics");
            sample_flusher.flush().await;

            // every metrics endpoint is keyed by the service key
            match api.get_service().await {
                Ok(_) => {
                    for flusher in &metrics_flushers {
                        flusher.flush().await;
                    }
                }
                Err(e) => error!("Dropping final metrics windows, no service key: {e}"),
            }

            drain_agent
                .shutdown()
                .map_err(|_| ServicesError::AlreadyStopped)?;
            service_task
                .await
                .map_err(|e| ServicesError::Runtime(e.to_string()))
        };

        match tokio::time::timeout(self.shutdown_grace, drain).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Final flush did not finish within {} ms",
                    self.shutdown_grace.as_millis()
                );
                if agent.shutdown().is_err() {
                    debug!("Agent service already stopped");
                }
                Err(ServicesError::ShutdownTimeout)
            }
        }
    }
}
