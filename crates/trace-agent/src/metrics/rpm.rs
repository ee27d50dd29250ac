// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-request tallies for inbound requests: response times and status codes.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::collector::{CollectorApi, CollectorError};
use crate::metrics::{nearest_rank, MetricsSource, Percentiles};

#[derive(Debug, Default)]
struct RpmWindow {
    response_times: Vec<i64>,
    status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpmSnapshot {
    pub timestamp: String,
    pub request_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<Percentiles>,
    pub status_code: BTreeMap<u16, u64>,
}

#[derive(Debug, Default)]
pub struct RpmMetrics {
    window: Mutex<RpmWindow>,
}

impl RpmMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response_time(&self, response_time: i64) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .response_times
            .push(response_time);
    }

    pub fn add_status_code(&self, status_code: u16) {
        *self
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status_codes
            .entry(status_code)
            .or_insert(0) += 1;
    }

    /// Takes the current window. Returns `None` when no request finished in it.
    pub fn take_snapshot(&self) -> Option<RpmSnapshot> {
        let mut window =
            std::mem::take(&mut *self.window.lock().unwrap_or_else(PoisonError::into_inner));

        if window.response_times.is_empty() && window.status_codes.is_empty() {
            return None;
        }

        Some(RpmSnapshot {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_count: window.response_times.len() as u64,
            response_time: nearest_rank(&mut window.response_times),
            status_code: window.status_codes,
        })
    }
}

#[async_trait]
impl MetricsSource for RpmMetrics {
    fn name(&self) -> &'static str {
        "RPM"
    }

    async fn flush_to(&self, api: &CollectorApi) -> Result<(), CollectorError> {
        match self.take_snapshot() {
            Some(snapshot) => api.send_rpm_metrics(&snapshot).await,
            None => {
                debug!("RPM | no finished requests in this window, skipping send");
                Ok(())
            }
        }
    }
}
