// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common builders for integration tests

#![allow(dead_code)]

use std::time::Duration;
use trace_agent::collector::{CollectorApi, CollectorApiConfig, RetryPolicy};
use trace_agent::config::{Config, Endpoints};
use trace_agent::events::{ServerReceive, ServerSend};

pub const TEST_API_KEY: &str = "mock-api-key";
pub const TEST_SERVICE_NAME: &str = "checkout";

/// Retry policy with millisecond delays so conflict tests stay fast.
pub fn fast_retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

pub fn collector_api(url: &str, max_attempts: u32) -> CollectorApi {
    CollectorApi::new(CollectorApiConfig {
        collector_api_url: url.to_string(),
        endpoints: Endpoints::default(),
        api_key: TEST_API_KEY.to_string(),
        service_name: TEST_SERVICE_NAME.to_string(),
        proxy_url: None,
        timeout: Duration::from_secs(2),
        retry_policy: fast_retry_policy(max_attempts),
    })
    .expect("failed to create collector api")
}

pub fn test_config(url: &str) -> Config {
    Config {
        api_key: TEST_API_KEY.to_string(),
        service_name: TEST_SERVICE_NAME.to_string(),
        collector_api_url: url.to_string(),
        endpoints: Endpoints::default(),
        collect_interval: Duration::from_secs(3600),
        initial_sample_rate: 1,
        sample_size: 60,
        ignore_headers: vec![],
        white_list_hosts: vec![],
        proxy_url: None,
        request_timeout: Duration::from_secs(2),
        registration_max_attempts: 3,
        registration_backoff_base: Duration::from_millis(1),
        registration_backoff_max: Duration::from_millis(4),
        shutdown_grace: Duration::from_secs(5),
    }
}

pub fn server_receive(transaction_id: &str, time: u64) -> ServerReceive {
    ServerReceive {
        transaction_id: transaction_id.to_string(),
        span_id: format!("{transaction_id}-span"),
        parent_span_id: None,
        host: "localhost".to_string(),
        endpoint: "/orders".to_string(),
        method: "GET".to_string(),
        origin_time: None,
        force_sample: false,
        time,
    }
}

pub fn server_send(transaction_id: &str, status_code: u16, response_time: i64) -> ServerSend {
    ServerSend {
        transaction_id: transaction_id.to_string(),
        span_id: format!("{transaction_id}-span"),
        status_code,
        response_time,
        time: 1_000 + response_time as u64 * 1_000,
    }
}
