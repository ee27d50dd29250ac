// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;
use tracing::warn;

const DEFAULT_COLLECTOR_API_URL: &str = "https://trace-collector-api.risingstack.com";
const DEFAULT_COLLECT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_INITIAL_SAMPLE_RATE: u64 = 1;
const DEFAULT_SAMPLE_SIZE: u64 = 60;

pub const SERVICE_ENDPOINT_PATH: &str = "/service";
pub const SAMPLE_ENDPOINT_PATH: &str = "/service/sample";
pub const APM_METRICS_ENDPOINT_PATH: &str = "/service/{serviceKey}/apm-metrics";
pub const RPM_METRICS_ENDPOINT_PATH: &str = "/service/{serviceKey}/rpm-metrics";
pub const EDGE_METRICS_ENDPOINT_PATH: &str = "/service/{serviceKey}/edge-metrics";

/// Collector paths. Templates may contain `{serviceKey}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub service: String,
    pub sample: String,
    pub apm_metrics: String,
    pub rpm_metrics: String,
    pub edge_metrics: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            service: SERVICE_ENDPOINT_PATH.to_string(),
            sample: SAMPLE_ENDPOINT_PATH.to_string(),
            apm_metrics: APM_METRICS_ENDPOINT_PATH.to_string(),
            rpm_metrics: RPM_METRICS_ENDPOINT_PATH.to_string(),
            edge_metrics: EDGE_METRICS_ENDPOINT_PATH.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub api_key: String,
    pub service_name: String,
    pub collector_api_url: String,
    pub endpoints: Endpoints,
    /// how often spans and metrics are flushed
    pub collect_interval: Duration,
    pub initial_sample_rate: u64,
    /// target number of sampled spans per collect interval
    pub sample_size: u64,
    /// headers instrumentation must not record
    pub ignore_headers: Vec<String>,
    /// `host:port` pairs instrumentation must not trace; always contains the collector
    pub white_list_hosts: Vec<String>,
    pub proxy_url: Option<String>,
    pub request_timeout: Duration,
    pub registration_max_attempts: u32,
    pub registration_backoff_base: Duration,
    pub registration_backoff_max: Duration,
    /// how long shutdown waits for the final flush
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn new() -> Result<Config, Box<dyn std::error::Error>> {
        let api_key = env::var("TRACE_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Missing apiKey"))?;

        let service_name = env::var("TRACE_SERVICE_NAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Missing serviceName"))?;

        let collector_api_url = env::var("TRACE_COLLECTOR_API_URL")
            .unwrap_or_else(|_| DEFAULT_COLLECTOR_API_URL.to_string());
        let white_list_hosts = vec![collector_host(&collector_api_url)?];

        let collect_interval = Duration::from_millis(
            parse_positive("TRACE_COLLECT_INTERVAL").unwrap_or(DEFAULT_COLLECT_INTERVAL_MS),
        );
        let initial_sample_rate =
            parse_positive("TRACE_INITIAL_SAMPLE_RATE").unwrap_or(DEFAULT_INITIAL_SAMPLE_RATE);
        let sample_size = parse_positive("TRACE_SAMPLE_SIZE").unwrap_or(DEFAULT_SAMPLE_SIZE);

        let ignore_headers = match env::var("TRACE_IGNORE_HEADERS") {
            Ok(raw) => serde_json::from_str::<Vec<String>>(&raw).unwrap_or_else(|e| {
                warn!("Cannot parse TRACE_IGNORE_HEADERS. Error: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        Ok(Config {
            api_key,
            service_name,
            collector_api_url,
            endpoints: Endpoints::default(),
            collect_interval,
            initial_sample_rate,
            sample_size,
            ignore_headers,
            white_list_hosts,
            proxy_url: env::var("TRACE_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            request_timeout: Duration::from_secs(10),
            registration_max_attempts: 5,
            registration_backoff_base: Duration::from_millis(250),
            registration_backoff_max: Duration::from_secs(8),
            shutdown_grace: Duration::from_secs(5),
        })
    }
}

fn parse_positive(var: &str) -> Option<u64> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!("Ignoring invalid {var} value '{raw}', using default");
            None
        }
    }
}

/// `host:port` of the collector, the form instrumentation compares outbound targets against.
fn collector_host(collector_api_url: &str) -> Result<String, anyhow::Error> {
    let url = reqwest::Url::parse(collector_api_url)
        .map_err(|e| anyhow::anyhow!("Invalid collector API URL '{collector_api_url}': {e}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Collector API URL '{collector_api_url}' has no host"))?;
    match url.port_or_known_default() {
        Some(port) => Ok(format!("{host}:{port}")),
        None => Ok(host.to_string()),
    }
}
