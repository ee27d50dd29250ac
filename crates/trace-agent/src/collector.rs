// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the trace collector.
//!
//! Every call is an authenticated JSON `POST`. The only call that is retried is
//! service registration: the collector answers `409 Conflict` while another
//! process is registering the same service name, so registration backs off
//! and tries again. Data sends are best effort and report failures to the
//! caller, which drops the window.

use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::agent::SamplePayload;
use crate::config::{Config, Endpoints};
use crate::http_utils::{build_client, collector_headers};
use crate::metrics::apm::ApmSnapshot;
use crate::metrics::edge::EdgeSnapshot;
use crate::metrics::rpm::RpmSnapshot;

/// Placeholder in endpoint templates that is replaced by the service key.
pub const SERVICE_KEY_PLACEHOLDER: &str = "{serviceKey}";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to create HTTP client: {0}")]
    Client(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{status} from {url}: {body}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("service registration still conflicting after {attempts} attempts")]
    RegistrationConflict { attempts: u32 },
    #[error("invalid service registration response: {0}")]
    InvalidResponse(String),
}

/// Backoff schedule for the registration conflict path.
///
/// Attempt `n` waits a random duration in `[d/2, d]` where
/// `d = min(base * 2^(n-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the wait after the given (1-based) failed attempt.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        let floor = ceiling / 2;
        if ceiling <= floor {
            return ceiling;
        }
        rand::thread_rng().gen_range(floor..=ceiling)
    }
}

pub struct CollectorApiConfig {
    pub collector_api_url: String,
    pub endpoints: Endpoints,
    pub api_key: String,
    pub service_name: String,
    pub proxy_url: Option<String>,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl From<&Config> for CollectorApiConfig {
    fn from(config: &Config) -> Self {
        CollectorApiConfig {
            collector_api_url: config.collector_api_url.clone(),
            endpoints: config.endpoints.clone(),
            api_key: config.api_key.clone(),
            service_name: config.service_name.clone(),
            proxy_url: config.proxy_url.clone(),
            timeout: config.request_timeout,
            retry_policy: RetryPolicy {
                max_attempts: config.registration_max_attempts,
                base_delay: config.registration_backoff_base,
                max_delay: config.registration_backoff_max,
            },
        }
    }
}

#[derive(Serialize)]
struct ServiceRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct ServiceResponse {
    key: u64,
}

struct Inner {
    client: reqwest::Client,
    headers: HeaderMap,
    collector_api_url: String,
    endpoints: Endpoints,
    service_name: String,
    retry_policy: RetryPolicy,
    service_key: OnceCell<u64>,
}

/// Cheap to clone; clones share the HTTP client and the cached service key.
#[derive(Clone)]
pub struct CollectorApi {
    inner: Arc<Inner>,
}

impl CollectorApi {
    pub fn new(config: CollectorApiConfig) -> Result<Self, CollectorError> {
        let client = build_client(config.proxy_url.as_deref(), config.timeout)
            .map_err(|e| CollectorError::Client(e.to_string()))?;
        let headers =
            collector_headers(&config.api_key).map_err(|e| CollectorError::Client(e.to_string()))?;

        Ok(CollectorApi {
            inner: Arc::new(Inner {
                client,
                headers,
                collector_api_url: config.collector_api_url.trim_end_matches('/').to_string(),
                endpoints: config.endpoints,
                service_name: config.service_name,
                retry_policy: config.retry_policy,
                service_key: OnceCell::new(),
            }),
        })
    }

    /// The service key, if registration already succeeded.
    pub fn service_key(&self) -> Option<u64> {
        self.inner.service_key.get().copied()
    }

    /// Resolves the service key, registering the service on first use.
    ///
    /// Concurrent callers wait for the same registration. A failed
    /// registration is not cached, so the next caller starts over.
    pub async fn get_service(&self) -> Result<u64, CollectorError> {
        self.inner
            .service_key
            .get_or_try_init(|| self.register_service())
            .await
            .copied()
    }

    async fn register_service(&self) -> Result<u64, CollectorError> {
        let url = self.url(&self.inner.endpoints.service);
        let body = ServiceRequest {
            name: &self.inner.service_name,
        };
        let retry_policy = &self.inner.retry_policy;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let response = self.post(&url, &body).await?;
            let status = response.status();

            if status.is_success() {
                let registered = response
                    .json::<ServiceResponse>()
                    .await
                    .map_err(|e| CollectorError::InvalidResponse(e.to_string()))?;
                info!(
                    "Registered service '{}' with key {} after {attempts} attempt(s)",
                    self.inner.service_name, registered.key
                );
                return Ok(registered.key);
            }

            if status != StatusCode::CONFLICT {
                let body = response.text().await.unwrap_or_default();
                error!("Service registration failed with {status}: {body}");
                return Err(CollectorError::UnexpectedStatus { url, status, body });
            }

            if attempts >= retry_policy.max_attempts {
                error!("Service registration still conflicting after {attempts} attempts, giving up");
                return Err(CollectorError::RegistrationConflict { attempts });
            }

            let delay = retry_policy.delay(attempts);
            warn!(
                "Service registration conflict (attempt {attempts}/{}), retrying in {} ms",
                retry_policy.max_attempts,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn send_samples(&self, payload: &SamplePayload) -> Result<(), CollectorError> {
        let url = self.url(&self.inner.endpoints.sample);
        self.send(&url, payload).await
    }

    pub async fn send_apm_metrics(&self, snapshot: &ApmSnapshot) -> Result<(), CollectorError> {
        let url = self.service_url(&self.inner.endpoints.apm_metrics).await?;
        self.send(&url, snapshot).await
    }

    pub async fn send_rpm_metrics(&self, snapshot: &RpmSnapshot) -> Result<(), CollectorError> {
        let url = self.service_url(&self.inner.endpoints.rpm_metrics).await?;
        self.send(&url, snapshot).await
    }

    pub async fn send_edge_metrics(&self, snapshot: &EdgeSnapshot) -> Result<(), CollectorError> {
        let url = self.service_url(&self.inner.endpoints.edge_metrics).await?;
        self.send(&url, snapshot).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.inner.collector_api_url)
    }

    async fn service_url(&self, template: &str) -> Result<String, CollectorError> {
        if !template.contains(SERVICE_KEY_PLACEHOLDER) {
            return Ok(self.url(template));
        }
        let service_key = self.get_service().await?;
        Ok(self.url(&format_endpoint(template, service_key)))
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<Response, CollectorError> {
        self.inner
            .client
            .post(url)
            .headers(self.inner.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|source| CollectorError::Request {
                url: url.to_string(),
                source,
            })
    }

    async fn send<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), CollectorError> {
        let time = Instant::now();
        let response = self.post(url, body).await?;
        let status = response.status();

        if status.is_success() {
            debug!(
                "Successfully sent payload in {} ms to {url}",
                time.elapsed().as_millis()
            );
            Ok(())
        } else {
            Err(CollectorError::UnexpectedStatus {
                url: url.to_string(),
                status,
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

/// Fills every `{serviceKey}` placeholder in an endpoint template.
pub fn format_endpoint(template: &str, service_key: u64) -> String {
    template.replace(SERVICE_KEY_PLACEHOLDER, &service_key.to_string())
}
